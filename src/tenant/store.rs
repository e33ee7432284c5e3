// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Tenant data store seam.
//!
//! The orchestrator never talks to a database directly; it reads tenant
//! configuration and tenant-scoped collections through [`TenantStore`].
//! Production wires this to the real data layer (out of scope here); tests
//! and development use [`InMemoryTenantStore`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Raw tenant configuration row, as the store sees it. The resolver turns
/// this into an immutable [`crate::tenant::TenantSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub display_name: String,
    pub industry: String,
    pub language: String,
    pub tone: String,
    pub dialed_number: Option<String>,
    pub greeting_text: Option<String>,
    /// Pre-rendered greeting audio (μ-law 8 kHz), replayed directly to the
    /// carrier when present.
    pub greeting_audio: Option<Vec<u8>>,
    pub voice: Option<String>,
    pub max_tool_calls_per_turn: Option<u32>,
    pub services_summary: Option<String>,
    pub working_hours_summary: Option<String>,
    pub policies_summary: Option<String>,
    pub faqs_summary: Option<String>,
}

/// A booking row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingRecord {
    pub booking_id: String,
    pub tenant_id: String,
    pub status: String,
    pub service: String,
    pub booking_datetime: String,
    pub duration_minutes: u32,
    pub customer_name: String,
    pub customer_phone: String,
}

/// One service a tenant offers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Working hours for one day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkingHoursEntry {
    pub day: String,
    pub hours: String,
}

/// A policy entry for a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyEntry {
    pub topic: String,
    pub content: String,
}

/// An FAQ entry for a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqEntry {
    pub topic: String,
    pub question: String,
    pub answer: String,
}

/// Read-only access to tenant configuration and tenant-scoped collections.
///
/// Every method is tenant-keyed; implementations must never return another
/// tenant's rows.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn tenant_by_id(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError>;

    async fn tenant_by_number(&self, number: &str) -> Result<Option<TenantRecord>, StoreError>;

    async fn latest_booking(
        &self,
        tenant_id: &str,
        customer_phone: &str,
    ) -> Result<Option<BookingRecord>, StoreError>;

    async fn booking_by_id(
        &self,
        tenant_id: &str,
        booking_id: &str,
    ) -> Result<Option<BookingRecord>, StoreError>;

    async fn services(&self, tenant_id: &str) -> Result<Vec<ServiceEntry>, StoreError>;

    async fn working_hours(&self, tenant_id: &str) -> Result<Vec<WorkingHoursEntry>, StoreError>;

    async fn policies(
        &self,
        tenant_id: &str,
        topic: &str,
    ) -> Result<Vec<PolicyEntry>, StoreError>;

    async fn faqs(&self, tenant_id: &str, topic: &str) -> Result<Vec<FaqEntry>, StoreError>;
}

// ---------------------------------------------------------------------------
// InMemoryTenantStore
// ---------------------------------------------------------------------------

/// Per-tenant data held by [`InMemoryTenantStore`].
#[derive(Debug, Clone, Default)]
pub struct TenantData {
    pub record: TenantRecord,
    pub bookings: Vec<BookingRecord>,
    pub services: Vec<ServiceEntry>,
    pub working_hours: Vec<WorkingHoursEntry>,
    pub policies: Vec<PolicyEntry>,
    pub faqs: Vec<FaqEntry>,
}

/// HashMap-backed [`TenantStore`] for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryTenantStore {
    tenants: Mutex<HashMap<String, TenantData>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tenant's data set.
    pub fn insert(&self, data: TenantData) {
        let mut tenants = self.tenants.lock().expect("tenant map poisoned");
        tenants.insert(data.record.tenant_id.clone(), data);
    }

    fn with_tenant<T>(&self, tenant_id: &str, f: impl FnOnce(&TenantData) -> T) -> Option<T> {
        let tenants = self.tenants.lock().expect("tenant map poisoned");
        tenants.get(tenant_id).map(f)
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn tenant_by_id(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        Ok(self.with_tenant(tenant_id, |data| data.record.clone()))
    }

    async fn tenant_by_number(&self, number: &str) -> Result<Option<TenantRecord>, StoreError> {
        let tenants = self.tenants.lock().expect("tenant map poisoned");
        Ok(tenants
            .values()
            .find(|data| data.record.dialed_number.as_deref() == Some(number))
            .map(|data| data.record.clone()))
    }

    async fn latest_booking(
        &self,
        tenant_id: &str,
        customer_phone: &str,
    ) -> Result<Option<BookingRecord>, StoreError> {
        Ok(self
            .with_tenant(tenant_id, |data| {
                data.bookings
                    .iter()
                    .filter(|b| b.customer_phone == customer_phone)
                    .last()
                    .cloned()
            })
            .flatten())
    }

    async fn booking_by_id(
        &self,
        tenant_id: &str,
        booking_id: &str,
    ) -> Result<Option<BookingRecord>, StoreError> {
        Ok(self
            .with_tenant(tenant_id, |data| {
                data.bookings
                    .iter()
                    .find(|b| b.booking_id == booking_id)
                    .cloned()
            })
            .flatten())
    }

    async fn services(&self, tenant_id: &str) -> Result<Vec<ServiceEntry>, StoreError> {
        Ok(self
            .with_tenant(tenant_id, |data| data.services.clone())
            .unwrap_or_default())
    }

    async fn working_hours(&self, tenant_id: &str) -> Result<Vec<WorkingHoursEntry>, StoreError> {
        Ok(self
            .with_tenant(tenant_id, |data| data.working_hours.clone())
            .unwrap_or_default())
    }

    async fn policies(
        &self,
        tenant_id: &str,
        topic: &str,
    ) -> Result<Vec<PolicyEntry>, StoreError> {
        Ok(self
            .with_tenant(tenant_id, |data| {
                data.policies
                    .iter()
                    .filter(|p| p.topic.eq_ignore_ascii_case(topic))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn faqs(&self, tenant_id: &str, topic: &str) -> Result<Vec<FaqEntry>, StoreError> {
        Ok(self
            .with_tenant(tenant_id, |data| {
                data.faqs
                    .iter()
                    .filter(|f| f.topic.eq_ignore_ascii_case(topic))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
