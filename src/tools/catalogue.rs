// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! The fixed, read-only tool catalogue.
//!
//! Six tenant-scoped lookup tools are declared to the model as function
//! schemas. Argument validation happens by deserializing the model's
//! argument object into the typed structs below; unknown or missing fields
//! surface as a schema error rather than reaching a handler.

use serde::Deserialize;
use serde_json::{json, Value};

/// Tool names, in catalogue order.
pub const TOOL_NAMES: [&str; 6] = [
    "get_latest_booking",
    "get_booking_by_id",
    "get_business_services",
    "get_working_hours",
    "get_policies",
    "get_faqs",
];

/// Arguments for `get_latest_booking`. The customer phone may be omitted;
/// the router falls back to the session caller's phone.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatestBookingArgs {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
}

/// Arguments for `get_booking_by_id`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BookingByIdArgs {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub booking_id: String,
}

/// Arguments for `get_business_services` and `get_working_hours`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantOnlyArgs {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Arguments for `get_policies` and `get_faqs`. A missing or blank topic
/// is not a schema error; it maps to the `Empty` outcome so the engine can
/// ask a clarifying question.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicArgs {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Function-call schemas declared to the model, in OpenAI tool format.
pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "get_latest_booking",
                "description": "Get the most recent booking for a customer by phone number.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "tenant_id": {"type": "string"},
                        "customer_phone": {"type": "string"},
                    },
                    "required": ["tenant_id"],
                    "additionalProperties": false,
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_booking_by_id",
                "description": "Get booking details by booking ID.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "tenant_id": {"type": "string"},
                        "booking_id": {"type": "string"},
                    },
                    "required": ["tenant_id", "booking_id"],
                    "additionalProperties": false,
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_business_services",
                "description": "Get the list of services offered by the business.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "tenant_id": {"type": "string"},
                    },
                    "required": ["tenant_id"],
                    "additionalProperties": false,
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_working_hours",
                "description": "Get working hours for the business.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "tenant_id": {"type": "string"},
                    },
                    "required": ["tenant_id"],
                    "additionalProperties": false,
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_policies",
                "description": "Get business policies by topic, e.g. cancellation or pricing.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "tenant_id": {"type": "string"},
                        "topic": {"type": "string"},
                    },
                    "required": ["tenant_id", "topic"],
                    "additionalProperties": false,
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "get_faqs",
                "description": "Get frequently asked questions by topic.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "tenant_id": {"type": "string"},
                        "topic": {"type": "string"},
                    },
                    "required": ["tenant_id", "topic"],
                    "additionalProperties": false,
                },
            },
        }),
    ]
}
