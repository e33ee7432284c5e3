// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Tenant-scoped tool router.
//!
//! Validates, dispatches, and time-boxes the read-only tool catalogue
//! against the tenant store. The router holds no mutable state beyond
//! invocation counters; every call fetches fresh tenant data (the store may
//! cache). The session tenant id is forced onto every call, so a model that
//! hallucinates another tenant's id still reads only its own data.

pub mod catalogue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::tenant::store::TenantStore;
use crate::tenant::TenantSnapshot;
use crate::tools::catalogue::{BookingByIdArgs, LatestBookingArgs, TenantOnlyArgs, TopicArgs};

/// Error taxonomy for tool outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorTag {
    /// Arguments failed schema validation.
    Schema,
    /// The tool name is not in the catalogue.
    UnknownTool,
    /// The referenced entity does not exist for this tenant.
    NotFound,
    /// The handler exceeded its time box.
    Timeout,
    /// Required input was absent (e.g. missing topic); the engine turns
    /// this into a clarifying question.
    Empty,
    /// The tenant store failed.
    Upstream,
}

/// The result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ToolOutcome {
    /// Structured payload for the model.
    Ok(Value),
    /// Tagged failure; surfaced to the model as an error object, never
    /// fatal to the call.
    Error(ToolErrorTag),
}

impl ToolOutcome {
    /// Render the outcome as the payload fed back to the model.
    pub fn to_llm_payload(&self) -> Value {
        match self {
            ToolOutcome::Ok(payload) => payload.clone(),
            ToolOutcome::Error(tag) => json!({ "error": tag }),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok(_))
    }
}

/// Audit record for one tool call, attached to the assistant turn that
/// triggered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    pub outcome: ToolOutcome,
    pub latency: Duration,
}

/// Routes validated tool calls to the tenant store.
pub struct ToolRouter {
    store: Arc<dyn TenantStore>,
    call_timeout: Duration,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl ToolRouter {
    pub fn new(store: Arc<dyn TenantStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Invoke a catalogue tool for the session tenant.
    ///
    /// `caller_phone` backs the latest-booking lookup when the model omits
    /// the customer phone. `deadline`, when set, caps the time box below the
    /// per-call timeout; it is the engine's cross-call budget for the turn.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        tenant: &TenantSnapshot,
        caller_phone: Option<&str>,
        deadline: Option<Instant>,
    ) -> ToolCallRecord {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let time_box = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(started);
                self.call_timeout.min(remaining)
            }
            None => self.call_timeout,
        };

        let outcome = if time_box.is_zero() {
            ToolOutcome::Error(ToolErrorTag::Timeout)
        } else {
            match tokio::time::timeout(
                time_box,
                self.dispatch(name, &arguments, tenant, caller_phone),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(tool = name, ?time_box, "Tool call timed out");
                    ToolOutcome::Error(ToolErrorTag::Timeout)
                }
            }
        };

        if !outcome.is_ok() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let latency = started.elapsed();
        debug!(tool = name, ok = outcome.is_ok(), ?latency, "Tool call finished");

        ToolCallRecord {
            name: name.to_string(),
            arguments,
            outcome,
            latency,
        }
    }

    /// Total invocations since startup.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Total failed invocations since startup.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: &Value,
        tenant: &TenantSnapshot,
        caller_phone: Option<&str>,
    ) -> ToolOutcome {
        // The session tenant always wins over whatever the model supplied.
        let tenant_id = tenant.tenant_id.as_str();

        match name {
            "get_latest_booking" => {
                let args: LatestBookingArgs = match parse_args(arguments) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                let phone = args
                    .customer_phone
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .or(caller_phone);
                let Some(phone) = phone else {
                    return ToolOutcome::Error(ToolErrorTag::Empty);
                };
                match self.store.latest_booking(tenant_id, phone).await {
                    Ok(Some(booking)) => ToolOutcome::Ok(json!({ "booking": booking })),
                    Ok(None) => ToolOutcome::Error(ToolErrorTag::NotFound),
                    Err(e) => upstream(name, e),
                }
            }
            "get_booking_by_id" => {
                let args: BookingByIdArgs = match parse_args(arguments) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                match self.store.booking_by_id(tenant_id, &args.booking_id).await {
                    Ok(Some(booking)) => ToolOutcome::Ok(json!({ "booking": booking })),
                    Ok(None) => ToolOutcome::Error(ToolErrorTag::NotFound),
                    Err(e) => upstream(name, e),
                }
            }
            "get_business_services" => {
                let _args: TenantOnlyArgs = match parse_args(arguments) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                match self.store.services(tenant_id).await {
                    Ok(services) if services.is_empty() => {
                        ToolOutcome::Error(ToolErrorTag::NotFound)
                    }
                    Ok(services) => ToolOutcome::Ok(json!({ "services": services })),
                    Err(e) => upstream(name, e),
                }
            }
            "get_working_hours" => {
                let _args: TenantOnlyArgs = match parse_args(arguments) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                match self.store.working_hours(tenant_id).await {
                    Ok(hours) if hours.is_empty() => ToolOutcome::Error(ToolErrorTag::NotFound),
                    Ok(hours) => ToolOutcome::Ok(json!({ "working_hours": hours })),
                    Err(e) => upstream(name, e),
                }
            }
            "get_policies" => {
                let args: TopicArgs = match parse_args(arguments) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                let Some(topic) = args.topic.filter(|t| !t.trim().is_empty()) else {
                    return ToolOutcome::Error(ToolErrorTag::Empty);
                };
                match self.store.policies(tenant_id, &topic).await {
                    Ok(policies) if policies.is_empty() => {
                        ToolOutcome::Error(ToolErrorTag::NotFound)
                    }
                    Ok(policies) => {
                        ToolOutcome::Ok(json!({ "topic": topic, "policies": policies }))
                    }
                    Err(e) => upstream(name, e),
                }
            }
            "get_faqs" => {
                let args: TopicArgs = match parse_args(arguments) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                let Some(topic) = args.topic.filter(|t| !t.trim().is_empty()) else {
                    return ToolOutcome::Error(ToolErrorTag::Empty);
                };
                match self.store.faqs(tenant_id, &topic).await {
                    Ok(faqs) if faqs.is_empty() => ToolOutcome::Error(ToolErrorTag::NotFound),
                    Ok(faqs) => ToolOutcome::Ok(json!({ "topic": topic, "faqs": faqs })),
                    Err(e) => upstream(name, e),
                }
            }
            other => {
                warn!(tool = other, "Unknown tool requested");
                ToolOutcome::Error(ToolErrorTag::UnknownTool)
            }
        }
    }
}

impl std::fmt::Debug for ToolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRouter")
            .field("call_timeout", &self.call_timeout)
            .field("invocations", &self.invocation_count())
            .field("failures", &self.failure_count())
            .finish()
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: &Value) -> Result<T, ToolOutcome> {
    serde_json::from_value(arguments.clone()).map_err(|e| {
        warn!(error = %e, "Tool arguments failed schema validation");
        ToolOutcome::Error(ToolErrorTag::Schema)
    })
}

fn upstream(name: &str, e: crate::error::StoreError) -> ToolOutcome {
    warn!(tool = name, error = %e, "Tenant store error");
    ToolOutcome::Error(ToolErrorTag::Upstream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
