// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Event and command types exchanged between the call session and its
//! collaborators.
//!
//! Each external leg of a call (carrier socket, STT stream, TTS stream, LLM
//! stream) is exposed to the session as a pair of mpsc channels carrying the
//! types defined here. The session's event loop is the single consumer of
//! every inbound channel, which is what makes the per-session ordering
//! guarantees cheap to uphold.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Carrier (telephony transport)
// ---------------------------------------------------------------------------

/// Metadata carried by the carrier's `start` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallStartInfo {
    /// Stream identifier assigned by the carrier; echoed on every outbound
    /// event.
    pub stream_sid: String,
    /// Tenant identifier from the stream's custom parameters, when present.
    pub tenant_id: Option<String>,
    /// Caller phone number from the custom parameters.
    pub caller_phone: Option<String>,
    /// Call record identifier from the custom parameters.
    pub call_id: Option<String>,
    /// The number the caller dialed, used as a tenant lookup fallback.
    pub dialed_number: Option<String>,
}

/// Inbound events from the carrier WebSocket, already decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierEvent {
    /// Socket-level handshake acknowledgement. Informational.
    Connected,
    /// Stream metadata; arrives once, before any media.
    Start(CallStartInfo),
    /// One decoded μ-law audio frame from the caller (8 kHz mono, 20 ms).
    Media(Vec<u8>),
    /// Playback reached a previously sent mark.
    Mark(String),
    /// The carrier ended the stream.
    Stop,
    /// The underlying socket closed or errored.
    ConnectionLost,
}

/// Outbound commands to the carrier WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierCommand {
    /// μ-law audio for playback to the caller.
    Audio(Vec<u8>),
    /// Ask the carrier to report when playback reaches this point.
    Mark(String),
    /// Drop any queued outbound audio (barge-in).
    Clear,
    /// Close the stream socket, ending the call.
    Close,
}

// ---------------------------------------------------------------------------
// STT
// ---------------------------------------------------------------------------

/// Events emitted by the streaming STT client.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// A transcript chunk. Interim results carry `is_final: false` and only
    /// feed diagnostics and barge-in detection; final results accumulate
    /// into the session's current-utterance buffer.
    Transcript { text: String, is_final: bool },
    /// Provider-side VAD detected the end of the user's utterance.
    UtteranceEnd,
    /// Provider-side VAD detected the start of user speech.
    SpeechStarted,
    /// The provider connection dropped; the client is retrying.
    Disconnected,
    /// The provider connection was re-established after a drop.
    Reconnected,
}

// ---------------------------------------------------------------------------
// TTS
// ---------------------------------------------------------------------------

/// Commands accepted by the streaming TTS client.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsCommand {
    /// Synthesize a text fragment. Fragments accumulate server-side until
    /// the next flush.
    Speak(String),
    /// Finalize the buffered text and emit the remaining audio, followed by
    /// a [`TtsEvent::Flushed`].
    Flush,
    /// Discard any synthesis in progress (barge-in).
    Clear,
    /// Close the provider connection.
    Close,
}

/// Events emitted by the streaming TTS client.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// One chunk of synthesized μ-law audio, carrier-ready as-is.
    Audio(Vec<u8>),
    /// The provider confirmed the current flush completed.
    Flushed,
    /// The provider connection dropped; the client is retrying.
    Disconnected,
    /// The provider connection was re-established after a drop.
    Reconnected,
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model mid-generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Provider-assigned tool call id, echoed back with the result.
    pub id: String,
    /// Tool name from the declared catalogue.
    pub name: String,
    /// Parsed argument object. Invalid JSON from the model is normalized to
    /// an empty object by the client.
    pub arguments: Value,
}

/// Why a generation stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Token limit reached.
    Length,
    /// The model requested one or more tool calls.
    ToolCalls,
    /// The stream ended without an explicit finish reason.
    Unknown,
}

/// Events produced by one streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    /// A content token (or token group) in generation order.
    Token(String),
    /// The model paused generation to request a tool invocation.
    ToolCallRequested(ToolCallRequest),
    /// Generation ended.
    Done(FinishReason),
}
