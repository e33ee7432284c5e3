// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Error types for the orchestrator.
//!
//! Each provider boundary gets its own error enum so that the session can
//! apply the recovery policy the failure class calls for: transient faults
//! are retried inside the owning client, provider exhaustion degrades the
//! call to a canned spoken message, and a lost carrier socket goes straight
//! to cleanup. Nothing in here crosses between sessions.

use thiserror::Error;

/// Failures on the carrier (telephony) WebSocket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The carrier socket closed or errored; the session must clean up.
    #[error("carrier connection lost")]
    ConnectionLost,
    /// The `start` event never arrived.
    #[error("carrier start event not received within {0:?}")]
    StartTimeout(std::time::Duration),
    /// A single outbound write failed.
    #[error("carrier send failed: {0}")]
    Send(String),
}

/// Failures in the streaming STT client.
#[derive(Debug, Error)]
pub enum SttError {
    #[error("stt connect failed: {0}")]
    Connect(String),
    #[error("stt send failed: {0}")]
    Send(String),
    /// The client exhausted its reconnect budget.
    #[error("stt connection closed after retries")]
    Exhausted,
}

/// Failures in the streaming TTS client.
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("tts connect failed: {0}")]
    Connect(String),
    #[error("tts send failed: {0}")]
    Send(String),
    #[error("tts connection closed after retries")]
    Exhausted,
}

/// Failures in the streaming LLM client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Http(String),
    #[error("llm api error (http {status}): {body}")]
    Api { status: u16, body: String },
    #[error("llm stream error: {0}")]
    Stream(String),
}

/// Failures reading from the tenant store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tenant store unavailable: {0}")]
    Unavailable(String),
}

/// Failures in the side-effect sinks (booking, SMS, call log). These are
/// recorded and surfaced in metrics but never fail the call.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink rejected the write: {0}")]
    Rejected(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Session-level failures that force the call to end.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A provider failed past its retry budget; the session speaks the
    /// degraded fallback line and ends gracefully.
    #[error("{0} provider unavailable")]
    ProviderUnavailable(&'static str),
}
