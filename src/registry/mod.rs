// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Process-wide session registry and supervisor.
//!
//! One concurrent map keyed by carrier call id, plus the graceful-shutdown
//! machinery: shutdown broadcasts cancellation to every live session and
//! waits up to a drain window before giving up on stragglers. Sessions are
//! otherwise fully independent.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Registry entry for one live call.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub tenant_id: String,
    pub started_at: Instant,
    cancel: CancellationToken,
}

/// Concurrent map of active sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    shutdown: CancellationToken,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a session and return its cancellation scope (a child of
    /// the process shutdown token). Registering the same call id twice
    /// replaces the old entry and cancels it.
    pub fn register(&self, call_id: &str, tenant_id: &str) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        let entry = SessionEntry {
            tenant_id: tenant_id.to_string(),
            started_at: Instant::now(),
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.sessions.insert(call_id.to_string(), entry) {
            warn!(call_id, "Replacing an existing session entry");
            previous.cancel.cancel();
        }
        info!(call_id, tenant_id, active = self.active_count(), "Session registered");
        cancel
    }

    /// Remove a session.
    pub fn unregister(&self, call_id: &str) {
        if self.sessions.remove(call_id).is_some() {
            info!(call_id, active = self.active_count(), "Session unregistered");
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.sessions.contains_key(call_id)
    }

    /// True once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run a session future under supervision: a panic inside the session
    /// is contained and logged, and the registry entry is always removed.
    pub async fn supervise<F, T>(&self, call_id: &str, session: F) -> Option<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(session);
        let result = match handle.await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(call_id, error = %e, "Session task failed");
                None
            }
        };
        self.unregister(call_id);
        result
    }

    /// Graceful shutdown: cancel every session, then wait up to `drain`
    /// for them to unregister themselves.
    pub async fn shutdown(&self, drain: Duration) {
        info!(active = self.active_count(), "Shutting down, draining sessions");
        self.shutdown.cancel();

        let deadline = Instant::now() + drain;
        while self.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.active_count();
        if remaining > 0 {
            warn!(remaining, "Drain window elapsed with sessions still active");
            self.sessions.clear();
        } else {
            info!("All sessions drained");
        }
    }
}

pub type SharedRegistry = Arc<SessionRegistry>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
