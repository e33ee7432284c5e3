// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Streaming AI service clients (STT, TTS, LLM).
//!
//! Each provider client is per-session: a call owns its own STT and TTS
//! WebSockets, so cancellation is a matter of dropping the session scope
//! rather than untangling a shared pool. The LLM client is stateless per
//! request and shared process-wide behind [`LanguageModel`].

pub mod deepgram_stt;
pub mod deepgram_tts;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::events::LlmEvent;

/// Generation bounds for one LLM request.
#[derive(Debug, Clone, Copy)]
pub struct GenerationBounds {
    pub max_tokens: u64,
    pub temperature: f64,
}

impl Default for GenerationBounds {
    fn default() -> Self {
        // Voice responses are deliberately short.
        Self {
            max_tokens: 150,
            temperature: 0.7,
        }
    }
}

/// A streaming chat-completion provider.
///
/// `stream_chat` returns once the provider has accepted the request; events
/// then arrive on the channel until [`LlmEvent::Done`]. Dropping the
/// receiver aborts the stream, which is how engine cancellation propagates.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_chat(
        &self,
        messages: Vec<Value>,
        tools: Vec<Value>,
        bounds: GenerationBounds,
    ) -> Result<mpsc::Receiver<LlmEvent>, LlmError>;
}
