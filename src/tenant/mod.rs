// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Tenant resolution and snapshot cache.
//!
//! A call is bound to exactly one tenant for its whole lifetime. The
//! resolver maps a tenant key (stream custom parameter, URL path segment,
//! or dialed number) to an immutable [`TenantSnapshot`] through a small
//! TTL cache, so a burst of calls to the same tenant costs one store read.
//!
//! An unknown tenant never fails the call: the resolver hands out a safe
//! generic snapshot (generic greeting, empty collections, default tool
//! policy) and the call proceeds degraded.

pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::tenant::store::{TenantRecord, TenantStore};

/// Voice synthesis configuration carried by a tenant snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    pub provider: String,
    pub voice: String,
    pub sample_rate: u32,
    pub encoding: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            provider: "deepgram".to_string(),
            voice: "aura-asteria-en".to_string(),
            sample_rate: 8000,
            encoding: "mulaw".to_string(),
        }
    }
}

/// Per-tenant tool limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolPolicy {
    /// Maximum tool calls the engine may dispatch in one assistant turn.
    pub max_calls_per_turn: u32,
    /// Timeout applied to each individual tool call.
    pub call_timeout: Duration,
    /// Hard deadline across all tool calls within one turn.
    pub turn_deadline: Duration,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            max_calls_per_turn: 2,
            call_timeout: Duration::from_millis(400),
            turn_deadline: Duration::from_millis(1000),
        }
    }
}

/// Immutable view of a tenant's configuration, resolved once per call.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantSnapshot {
    pub tenant_id: String,
    pub display_name: String,
    pub industry: String,
    pub language: String,
    pub tone: String,
    pub dialed_number: Option<String>,
    pub greeting_text: String,
    /// Pre-rendered μ-law greeting, replayed directly when present.
    pub greeting_audio: Option<Vec<u8>>,
    pub voice: VoiceConfig,
    pub tool_policy: ToolPolicy,
    /// Prompt template variables.
    pub services_summary: String,
    pub working_hours_summary: String,
    pub policies_summary: String,
    pub faqs_summary: String,
    /// False for the generic fallback snapshot handed to unknown tenants.
    pub known: bool,
}

impl TenantSnapshot {
    /// Build a snapshot from a store record, filling gaps with defaults.
    pub fn from_record(record: TenantRecord) -> Self {
        Self::from_record_with_policy(record, ToolPolicy::default())
    }

    /// Build a snapshot with process-level tool-policy defaults; the
    /// record's own limits still win where present.
    pub fn from_record_with_policy(record: TenantRecord, base_policy: ToolPolicy) -> Self {
        let display_name = if record.display_name.is_empty() {
            "our business".to_string()
        } else {
            record.display_name
        };
        let greeting_text = record.greeting_text.unwrap_or_else(|| {
            format!("G'day! Welcome to {}. How can I help you today?", display_name)
        });
        let mut voice = VoiceConfig::default();
        if let Some(v) = record.voice {
            voice.voice = v;
        }
        let mut tool_policy = base_policy;
        if let Some(max) = record.max_tool_calls_per_turn {
            tool_policy.max_calls_per_turn = max;
        }
        Self {
            tenant_id: record.tenant_id,
            display_name,
            industry: or_default(record.industry, "business"),
            language: or_default(record.language, "en-AU"),
            tone: or_default(record.tone, "warm, friendly, and professional"),
            dialed_number: record.dialed_number,
            greeting_text,
            greeting_audio: record.greeting_audio,
            voice,
            tool_policy,
            services_summary: record
                .services_summary
                .unwrap_or_else(|| "Ask if the caller needs a service.".to_string()),
            working_hours_summary: record
                .working_hours_summary
                .unwrap_or_else(|| "Ask if the caller needs business hours.".to_string()),
            policies_summary: record
                .policies_summary
                .unwrap_or_else(|| "Not provided.".to_string()),
            faqs_summary: record.faqs_summary.unwrap_or_else(|| "Not provided.".to_string()),
            known: true,
        }
    }

    /// The safe generic snapshot for unresolvable tenants. Tool calls under
    /// this snapshot hit an empty tenant id and come back `NotFound`.
    pub fn fallback() -> Self {
        let mut snapshot = Self::from_record(TenantRecord {
            tenant_id: "unknown".to_string(),
            display_name: "our business".to_string(),
            ..TenantRecord::default()
        });
        snapshot.known = false;
        snapshot
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// TenantResolver
// ---------------------------------------------------------------------------

struct CacheEntry {
    snapshot: Arc<TenantSnapshot>,
    expires_at: Instant,
}

/// Maps tenant keys to cached snapshots.
///
/// Shared across sessions; the cache map is the only shared mutable state
/// and is guarded by a plain mutex held only for map operations. Snapshots
/// are immutable once returned.
pub struct TenantResolver {
    store: Arc<dyn TenantStore>,
    ttl: Duration,
    base_policy: ToolPolicy,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn TenantStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            base_policy: ToolPolicy::default(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Builder method: set the process-level tool-policy defaults applied
    /// to every resolved snapshot.
    pub fn with_tool_policy(mut self, policy: ToolPolicy) -> Self {
        self.base_policy = policy;
        self
    }

    /// Resolve a tenant snapshot. Preference order: explicit tenant id
    /// (stream custom parameter or URL segment), then dialed number.
    ///
    /// Never fails: an unknown tenant yields the generic fallback snapshot.
    pub async fn resolve(
        &self,
        tenant_id: Option<&str>,
        dialed_number: Option<&str>,
    ) -> Arc<TenantSnapshot> {
        if let Some(id) = tenant_id.filter(|id| !id.is_empty()) {
            if let Some(snapshot) = self.cached(id) {
                return snapshot;
            }
            match self.store.tenant_by_id(id).await {
                Ok(Some(record)) => return self.admit(id, record),
                Ok(None) => debug!(tenant_id = id, "Tenant id not found"),
                Err(e) => warn!(tenant_id = id, error = %e, "Tenant store lookup failed"),
            }
        }

        if let Some(number) = dialed_number.filter(|n| !n.is_empty()) {
            let key = format!("number:{}", number);
            if let Some(snapshot) = self.cached(&key) {
                return snapshot;
            }
            match self.store.tenant_by_number(number).await {
                Ok(Some(record)) => return self.admit(&key, record),
                Ok(None) => debug!(number, "Dialed number not mapped to a tenant"),
                Err(e) => warn!(number, error = %e, "Tenant store lookup failed"),
            }
        }

        warn!(?tenant_id, ?dialed_number, "Unknown tenant, using generic snapshot");
        Arc::new(TenantSnapshot::fallback())
    }

    /// Number of live (unexpired) cache entries. Expired entries may still
    /// be counted until their next lookup evicts them.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("tenant cache poisoned").len()
    }

    fn cached(&self, key: &str) -> Option<Arc<TenantSnapshot>> {
        let mut cache = self.cache.lock().expect("tenant cache poisoned");
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.snapshot.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn admit(&self, key: &str, record: TenantRecord) -> Arc<TenantSnapshot> {
        let snapshot = Arc::new(TenantSnapshot::from_record_with_policy(
            record,
            self.base_policy,
        ));
        let mut cache = self.cache.lock().expect("tenant cache poisoned");
        cache.insert(
            key.to_string(),
            CacheEntry {
                snapshot: snapshot.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        snapshot
    }
}

impl std::fmt::Debug for TenantResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantResolver")
            .field("ttl", &self.ttl)
            .field("cached", &self.cache_len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
