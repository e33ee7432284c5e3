// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Environment-sourced configuration.
//!
//! The orchestrator is configured entirely through environment variables
//! (loaded from `.env` in `main` before this module runs). Every knob has a
//! production default; unparseable values fall back to the default with a
//! warning rather than aborting startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Full configuration for the orchestrator process.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bind host for the carrier-facing server.
    pub host: String,
    /// Bind port for the carrier-facing server.
    pub port: u16,

    /// Deepgram API key, shared by the STT and TTS clients.
    pub deepgram_api_key: Option<String>,
    /// STT WebSocket endpoint (overridable for mocks and proxies).
    pub stt_url: String,
    /// TTS WebSocket endpoint.
    pub tts_url: String,

    /// OpenAI-compatible API key.
    pub openai_api_key: Option<String>,
    /// OpenAI-compatible base URL (no path).
    pub openai_base_url: String,
    /// Chat model identifier.
    pub llm_model: String,

    /// Tenant snapshot cache TTL.
    pub tenant_cache_ttl: Duration,
    /// Per-call tool timeout.
    pub tool_timeout: Duration,
    /// Maximum tool calls per assistant turn.
    pub tool_budget_per_turn: u32,
    /// Hard deadline across all tool calls in one turn.
    pub tool_turn_deadline: Duration,
    /// Grace window coalescing rapid utterance-end signals.
    pub utterance_debounce: Duration,
    /// STT endpoint-silence threshold in milliseconds.
    pub stt_endpointing_ms: u32,
    /// STT utterance-end delay in milliseconds.
    pub stt_utterance_end_ms: u32,
    /// End the call after this long with no audio in either direction.
    pub session_idle_timeout: Duration,
    /// How long graceful shutdown waits for in-flight calls to drain.
    pub shutdown_drain: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            deepgram_api_key: None,
            stt_url: "wss://api.deepgram.com/v1/listen".to_string(),
            tts_url: "wss://api.deepgram.com/v1/speak".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            tenant_cache_ttl: Duration::from_secs(300),
            tool_timeout: Duration::from_millis(400),
            tool_budget_per_turn: 2,
            tool_turn_deadline: Duration::from_millis(1000),
            utterance_debounce: Duration::from_millis(500),
            stt_endpointing_ms: 2500,
            stt_utterance_end_ms: 2000,
            session_idle_timeout: Duration::from_secs(30),
            shutdown_drain: Duration::from_secs(10),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("FRONTDESK_HOST", defaults.host),
            port: env_parsed("FRONTDESK_PORT", defaults.port),
            deepgram_api_key: env::var("DEEPGRAM_API_KEY").ok().filter(|v| !v.is_empty()),
            stt_url: env_string("DEEPGRAM_STT_URL", defaults.stt_url),
            tts_url: env_string("DEEPGRAM_TTS_URL", defaults.tts_url),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty()),
            openai_base_url: env_string("OPENAI_BASE_URL", defaults.openai_base_url),
            llm_model: env_string("LLM_MODEL", defaults.llm_model),
            tenant_cache_ttl: Duration::from_secs(env_parsed(
                "TENANT_CACHE_TTL_SECS",
                defaults.tenant_cache_ttl.as_secs(),
            )),
            tool_timeout: Duration::from_millis(env_parsed(
                "TOOL_TIMEOUT_MS",
                defaults.tool_timeout.as_millis() as u64,
            )),
            tool_budget_per_turn: env_parsed(
                "TOOL_BUDGET_PER_TURN",
                defaults.tool_budget_per_turn,
            ),
            tool_turn_deadline: Duration::from_millis(env_parsed(
                "TOOL_TURN_DEADLINE_MS",
                defaults.tool_turn_deadline.as_millis() as u64,
            )),
            utterance_debounce: Duration::from_millis(env_parsed(
                "UTTERANCE_DEBOUNCE_MS",
                defaults.utterance_debounce.as_millis() as u64,
            )),
            stt_endpointing_ms: env_parsed("STT_ENDPOINTING_MS", defaults.stt_endpointing_ms),
            stt_utterance_end_ms: env_parsed(
                "STT_UTTERANCE_END_MS",
                defaults.stt_utterance_end_ms,
            ),
            session_idle_timeout: Duration::from_secs(env_parsed(
                "SESSION_IDLE_TIMEOUT_SECS",
                defaults.session_idle_timeout.as_secs(),
            )),
            shutdown_drain: Duration::from_secs(env_parsed(
                "SHUTDOWN_DRAIN_SECS",
                defaults.shutdown_drain.as_secs(),
            )),
        }
    }

    /// The socket address string the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_string(key: &str, default: String) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_parsed<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    default = %default,
                    "Ignoring unparseable configuration value"
                );
                default
            }
        },
        Err(_) => default,
    }
}
