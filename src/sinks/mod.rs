// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Side-effect sinks and the booking-workflow probe.
//!
//! The orchestrator itself is read-only; the only writes a call produces go
//! through the traits here: a booking record, a confirmation SMS, and the
//! final call log. All three are external collaborators. Sink failures are
//! recorded in metrics and never fail the call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::info;

use crate::error::SinkError;
use crate::session::history::{ConversationHistory, Role};

/// A booking intent assembled from the conversation, handed to the booking
/// sink once per call.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingIntent {
    pub tenant_id: String,
    pub caller_phone: Option<String>,
    pub customer_name: String,
    /// The assistant's confirmation sentence, kept verbatim for the record.
    pub confirmation: String,
}

/// Final call record written at cleanup.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: String,
    pub tenant_id: String,
    pub caller_phone: Option<String>,
    pub transcript: String,
    pub outcome: String,
}

/// Writes booking records. External collaborator.
#[async_trait]
pub trait BookingSink: Send + Sync {
    /// Returns the created booking reference.
    async fn create_booking(&self, intent: &BookingIntent) -> Result<String, SinkError>;
}

/// Sends confirmation SMS messages. External collaborator.
#[async_trait]
pub trait SmsSink: Send + Sync {
    async fn send_confirmation(&self, to: &str, body: &str) -> Result<(), SinkError>;
}

/// Persists the call transcript and outcome. External collaborator.
#[async_trait]
pub trait CallLogSink: Send + Sync {
    async fn record_call(&self, record: &CallRecord) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// Logging defaults
// ---------------------------------------------------------------------------

/// Default sink that logs and succeeds. Stands in wherever the real
/// collaborators are not wired up.
#[derive(Debug, Default)]
pub struct LoggingSink;

/// Booking references handed out by [`LoggingSink`]: wall-clock nanos plus
/// a process-local counter, collision-resistant without an id crate. Real
/// booking sinks assign their own references.
fn booking_reference() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("bk-{}-{}", nanos, count)
}

#[async_trait]
impl BookingSink for LoggingSink {
    async fn create_booking(&self, intent: &BookingIntent) -> Result<String, SinkError> {
        let reference = booking_reference();
        info!(
            tenant_id = %intent.tenant_id,
            customer = %intent.customer_name,
            reference = %reference,
            "Booking recorded"
        );
        Ok(reference)
    }
}

#[async_trait]
impl SmsSink for LoggingSink {
    async fn send_confirmation(&self, to: &str, body: &str) -> Result<(), SinkError> {
        info!(to, chars = body.len(), "Confirmation SMS sent");
        Ok(())
    }
}

#[async_trait]
impl CallLogSink for LoggingSink {
    async fn record_call(&self, record: &CallRecord) -> Result<(), SinkError> {
        info!(
            call_id = %record.call_id,
            tenant_id = %record.tenant_id,
            outcome = %record.outcome,
            transcript_chars = record.transcript.len(),
            "Call log recorded"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Booking-workflow probe
// ---------------------------------------------------------------------------

/// Phrases in a completed assistant turn that signal a confirmed booking.
const CONFIRMATION_MARKERS: [&str; 4] = [
    "booked",
    "booking is confirmed",
    "locked that in",
    "i've made the booking",
];

/// Examine the history for a completed booking confirmation.
///
/// Runs after each sealed assistant turn; the session fires the booking
/// sink on the first hit and never again for that call.
pub fn detect_booking(
    history: &ConversationHistory,
    tenant_id: &str,
    caller_phone: Option<&str>,
) -> Option<BookingIntent> {
    let confirmation = history.last_assistant_text()?;
    let lower = confirmation.to_lowercase();
    if !CONFIRMATION_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return None;
    }
    Some(BookingIntent {
        tenant_id: tenant_id.to_string(),
        caller_phone: caller_phone.map(|p| p.to_string()),
        customer_name: extract_customer_name(history),
        confirmation: confirmation.to_string(),
    })
}

/// Pull the customer's name out of the user turns, newest first. Tolerant
/// of noisy ASR output; falls back to "Customer".
fn extract_customer_name(history: &ConversationHistory) -> String {
    for turn in history.turns().iter().rev() {
        if turn.role != Role::User {
            continue;
        }
        let lower = turn.content.to_lowercase();
        for marker in ["my name is", "this is", "i'm", "i am"] {
            // Offsets into the lowercased copy only; to_lowercase is not
            // byte-stable for every script.
            if let Some(idx) = lower.find(marker) {
                let after = &lower[idx + marker.len()..];
                if let Some(name) = after.split_whitespace().find_map(clean_name_token) {
                    return name;
                }
            }
        }
    }
    "Customer".to_string()
}

/// Normalize a potential name token to a capitalized alphabetic string.
fn clean_name_token(token: &str) -> Option<String> {
    let cleaned: String = token.chars().filter(|c| c.is_alphabetic()).collect();
    if cleaned.is_empty() {
        return None;
    }
    let mut chars = cleaned.chars();
    let first = chars.next()?.to_uppercase().to_string();
    Some(first + &chars.as_str().to_lowercase())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
