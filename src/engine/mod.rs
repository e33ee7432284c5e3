// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Conversation engine: one user utterance in, one assistant turn out.
//!
//! The engine composes the LLM client and the tool router. It streams
//! assistant tokens, forwards text to the TTS command channel at natural
//! flush boundaries, dispatches mid-stream tool calls (with the tenant id
//! forced and a per-turn budget), and resumes generation with each tool
//! result. A run ends with the residual buffer flushed and a final
//! `TtsCommand::Flush`, or early when its cancellation token fires
//! (barge-in, call end).
//!
//! Exactly one engine run per session executes at a time; the session's
//! single-flight lock lives outside this module.

pub mod prompt;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{LlmEvent, ToolCallRequest, TtsCommand};
use crate::services::openai::tool_result_messages;
use crate::services::{GenerationBounds, LanguageModel};
use crate::tenant::TenantSnapshot;
use crate::tools::{ToolCallRecord, ToolErrorTag, ToolOutcome, ToolRouter};

/// Spoken when the LLM provider fails mid-turn.
pub const LLM_TROUBLE_LINE: &str =
    "Sorry, I'm having trouble right now. Can you say that again?";

/// Clarifying question for topic-style tools that came back empty.
const TOPIC_CLARIFY_LINE: &str =
    "Which topic should I check? For example: cancellation, pricing, or parking.";

/// Clarifying question when a booking lookup has no phone to go on.
const PHONE_CLARIFY_LINE: &str =
    "Could I grab the mobile number the booking was made under?";

/// Inputs for one engine run.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Full message list: system prompt, prior turns, and the latest user
    /// utterance (already sealed by the session).
    pub messages: Vec<Value>,
    pub tenant: Arc<TenantSnapshot>,
    pub caller_phone: Option<String>,
}

/// The sealed result of one engine run.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Everything streamed before completion or cancellation.
    pub assistant_text: String,
    /// True when the run was cancelled (barge-in, call end). The session
    /// commits the partial turn with its `interrupted` flag set.
    pub interrupted: bool,
    /// Audit records for every executed tool call, in order.
    pub tool_calls: Vec<ToolCallRecord>,
    /// True when the LLM provider failed and the canned line was spoken.
    pub degraded: bool,
    /// When the first token arrived, for the session's latency metrics.
    pub first_token_at: Option<Instant>,
}

/// Decide whether the outbound buffer should be flushed to TTS.
///
/// Sentence endings flush immediately; clause breaks flush once at least
/// 10 characters are buffered; anything past 50 characters flushes
/// regardless. This yields perceived-immediate speech without chopping
/// prosody mid-clause.
pub(crate) fn should_flush(buffer: &str) -> bool {
    let trimmed = buffer.trim_end();
    let Some(last) = trimmed.chars().last() else {
        return false;
    };
    match last {
        '.' | '!' | '?' => true,
        ',' | ';' | ':' => buffer.len() >= 10,
        _ => buffer.len() > 50,
    }
}

/// Composes the LLM client and tool router to execute user turns.
pub struct ConversationEngine {
    llm: Arc<dyn LanguageModel>,
    router: Arc<ToolRouter>,
    bounds: GenerationBounds,
}

impl ConversationEngine {
    pub fn new(llm: Arc<dyn LanguageModel>, router: Arc<ToolRouter>) -> Self {
        Self {
            llm,
            router,
            bounds: GenerationBounds::default(),
        }
    }

    /// Builder method: override the generation bounds.
    pub fn with_bounds(mut self, bounds: GenerationBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Execute one user turn.
    ///
    /// Text fragments go to `speak` as they reach flush boundaries; the
    /// final `TtsCommand::Flush` is sent only when the run completes
    /// uncancelled. The pending buffer is discarded on cancellation.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        speak: &mpsc::Sender<TtsCommand>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let mut messages = request.messages;
        let tools = crate::tools::catalogue::tool_schemas();
        let policy = request.tenant.tool_policy;

        let mut text = String::new();
        let mut buffer = String::new();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut memo: HashMap<String, Value> = HashMap::new();
        let mut calls_used: u32 = 0;
        let mut turn_deadline: Option<Instant> = None;
        let mut first_token_at: Option<Instant> = None;
        let mut interrupted = false;
        let mut degraded = false;

        'generation: loop {
            let mut events = match self
                .llm
                .stream_chat(messages.clone(), tools.clone(), self.bounds)
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "LLM stream failed, speaking fallback line");
                    degraded = true;
                    let _ = speak
                        .send(TtsCommand::Speak(LLM_TROUBLE_LINE.to_string()))
                        .await;
                    text.push_str(LLM_TROUBLE_LINE);
                    break 'generation;
                }
            };

            let mut pending: Vec<ToolCallRequest> = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        interrupted = true;
                        break 'generation;
                    }
                    event = events.recv() => match event {
                        Some(LlmEvent::Token(token)) => {
                            if first_token_at.is_none() {
                                first_token_at = Some(Instant::now());
                            }
                            text.push_str(&token);
                            buffer.push_str(&token);
                            if should_flush(&buffer) {
                                let fragment = std::mem::take(&mut buffer);
                                if speak.send(TtsCommand::Speak(fragment)).await.is_err() {
                                    interrupted = true;
                                    break 'generation;
                                }
                            }
                        }
                        Some(LlmEvent::ToolCallRequested(req)) => pending.push(req),
                        Some(LlmEvent::Done(reason)) => {
                            debug!(?reason, "Generation round finished");
                            break;
                        }
                        None => break,
                    }
                }
            }

            if pending.is_empty() {
                break 'generation;
            }

            for req in pending {
                if cancel.is_cancelled() {
                    interrupted = true;
                    break 'generation;
                }

                calls_used += 1;
                if calls_used > policy.max_calls_per_turn {
                    // Past the budget the model gets a synthetic result and
                    // is left to finalize without further tools.
                    debug!(tool = %req.name, "Tool budget exhausted, sending synthetic result");
                    for msg in
                        tool_result_messages(&req, &json!({"error": "tool_budget_exhausted"}))
                    {
                        messages.push(msg);
                    }
                    continue;
                }

                // The cross-call deadline starts at the first tool call of
                // the turn.
                let deadline =
                    *turn_deadline.get_or_insert_with(|| Instant::now() + policy.turn_deadline);

                let memo_key = format!("{}:{}", req.name, req.arguments);
                let record = match memo.get(&memo_key) {
                    Some(payload) => ToolCallRecord {
                        name: req.name.clone(),
                        arguments: req.arguments.clone(),
                        outcome: ToolOutcome::Ok(payload.clone()),
                        latency: Duration::ZERO,
                    },
                    None => {
                        self.router
                            .invoke(
                                &req.name,
                                req.arguments.clone(),
                                &request.tenant,
                                request.caller_phone.as_deref(),
                                Some(deadline),
                            )
                            .await
                    }
                };

                if record.outcome == ToolOutcome::Error(ToolErrorTag::Empty) {
                    // Required input was missing; ask instead of guessing.
                    records.push(record);
                    let line = match req.name.as_str() {
                        "get_latest_booking" => PHONE_CLARIFY_LINE,
                        _ => TOPIC_CLARIFY_LINE,
                    };
                    if !buffer.is_empty() {
                        let fragment = std::mem::take(&mut buffer);
                        let _ = speak.send(TtsCommand::Speak(fragment)).await;
                    }
                    let _ = speak.send(TtsCommand::Speak(line.to_string())).await;
                    text.push_str(line);
                    break 'generation;
                }

                if let ToolOutcome::Ok(ref payload) = record.outcome {
                    memo.insert(memo_key, payload.clone());
                }
                let payload = record.outcome.to_llm_payload();
                records.push(record);
                for msg in tool_result_messages(&req, &payload) {
                    messages.push(msg);
                }
            }
            // Resume the generation with the tool results appended.
        }

        if interrupted {
            // The buffer never reached the carrier; drop it.
            buffer.clear();
            return TurnOutcome {
                assistant_text: text,
                interrupted: true,
                tool_calls: records,
                degraded,
                first_token_at,
            };
        }

        if !buffer.is_empty() {
            let _ = speak.send(TtsCommand::Speak(buffer)).await;
        }
        let _ = speak.send(TtsCommand::Flush).await;

        TurnOutcome {
            assistant_text: text,
            interrupted: false,
            tool_calls: records,
            degraded,
            first_token_at,
        }
    }
}

impl fmt::Debug for ConversationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationEngine")
            .field("bounds", &self.bounds)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::error::LlmError;
    use crate::events::FinishReason;
    use crate::tenant::store::{InMemoryTenantStore, TenantData, TenantRecord, WorkingHoursEntry};

    // -- flush boundaries ----------------------------------------------------

    #[test]
    fn flushes_on_sentence_end() {
        assert!(should_flush("Hi."));
        assert!(should_flush("Really?"));
        assert!(should_flush("No way!"));
        assert!(should_flush("Done. "));
    }

    #[test]
    fn comma_needs_ten_characters() {
        assert!(!should_flush("Hi,"));
        assert!(should_flush("No worries,"));
        assert!(should_flush("Certainly;"));
    }

    #[test]
    fn long_buffer_flushes_without_punctuation() {
        let long = "a".repeat(51);
        assert!(should_flush(&long));
        let short = "a".repeat(50);
        assert!(!should_flush(&short));
    }

    #[test]
    fn empty_and_whitespace_do_not_flush() {
        assert!(!should_flush(""));
        assert!(!should_flush("   "));
    }

    // -- scripted LLM --------------------------------------------------------

    /// Pops one scripted event list per `stream_chat` call.
    struct ScriptedModel {
        rounds: Mutex<Vec<Vec<LlmEvent>>>,
        calls: Mutex<Vec<Vec<Value>>>,
    }

    impl ScriptedModel {
        fn new(rounds: Vec<Vec<LlmEvent>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn stream_chat(
            &self,
            messages: Vec<Value>,
            _tools: Vec<Value>,
            _bounds: GenerationBounds,
        ) -> Result<mpsc::Receiver<LlmEvent>, LlmError> {
            self.calls.lock().unwrap().push(messages);
            let mut rounds = self.rounds.lock().unwrap();
            if rounds.is_empty() {
                return Err(LlmError::Http("script exhausted".to_string()));
            }
            let round = rounds.remove(0);
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                for event in round {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn tokens(words: &[&str]) -> Vec<LlmEvent> {
        let mut events: Vec<LlmEvent> =
            words.iter().map(|w| LlmEvent::Token(w.to_string())).collect();
        events.push(LlmEvent::Done(FinishReason::Stop));
        events
    }

    fn engine_with(
        rounds: Vec<Vec<LlmEvent>>,
    ) -> (ConversationEngine, Arc<ScriptedModel>, Arc<ToolRouter>) {
        let store = Arc::new(InMemoryTenantStore::new());
        store.insert(TenantData {
            record: TenantRecord {
                tenant_id: "acme-plumb".to_string(),
                display_name: "Acme Plumbing".to_string(),
                ..TenantRecord::default()
            },
            working_hours: vec![WorkingHoursEntry {
                day: "Monday".to_string(),
                hours: "9am-5pm".to_string(),
            }],
            ..TenantData::default()
        });
        let model = Arc::new(ScriptedModel::new(rounds));
        let router = Arc::new(ToolRouter::new(store, Duration::from_millis(400)));
        (
            ConversationEngine::new(model.clone(), router.clone()),
            model,
            router,
        )
    }

    fn request() -> TurnRequest {
        TurnRequest {
            messages: vec![json!({"role": "user", "content": "What are your hours?"})],
            tenant: Arc::new(TenantSnapshot::from_record(TenantRecord {
                tenant_id: "acme-plumb".to_string(),
                display_name: "Acme Plumbing".to_string(),
                ..TenantRecord::default()
            })),
            caller_phone: Some("+61400000001".to_string()),
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<TtsCommand>) -> Vec<TtsCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[tokio::test]
    async fn plain_turn_streams_and_flushes() {
        let (engine, _, _) = engine_with(vec![tokens(&["We're ", "open ", "nine ", "to ", "five."])]);
        let (speak_tx, mut speak_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let outcome = engine.run_turn(request(), &speak_tx, &cancel).await;

        assert!(!outcome.interrupted);
        assert_eq!(outcome.assistant_text, "We're open nine to five.");
        assert!(outcome.tool_calls.is_empty());
        assert!(outcome.first_token_at.is_some());

        let commands = drain(&mut speak_rx).await;
        assert_eq!(
            commands.last(),
            Some(&TtsCommand::Flush),
            "run must end with a flush"
        );
        let spoken: String = commands
            .iter()
            .filter_map(|c| match c {
                TtsCommand::Speak(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(spoken, "We're open nine to five.");
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let tool_round = vec![
            LlmEvent::ToolCallRequested(ToolCallRequest {
                id: "call_1".to_string(),
                name: "get_working_hours".to_string(),
                arguments: json!({"tenant_id": "acme-plumb"}),
            }),
            LlmEvent::Done(FinishReason::ToolCalls),
        ];
        let (engine, model, _) = engine_with(vec![
            tool_round,
            tokens(&["Open ", "Monday ", "nine ", "to ", "five."]),
        ]);
        let (speak_tx, _speak_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let outcome = engine.run_turn(request(), &speak_tx, &cancel).await;

        assert_eq!(outcome.tool_calls.len(), 1);
        assert!(outcome.tool_calls[0].outcome.is_ok());
        assert_eq!(outcome.assistant_text, "Open Monday nine to five.");

        // The second round must have seen the tool result messages.
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let second = &calls[1];
        assert_eq!(second[second.len() - 2]["role"], "assistant");
        assert_eq!(second[second.len() - 1]["role"], "tool");
    }

    #[tokio::test]
    async fn budget_exhaustion_sends_synthetic_result() {
        let tool_request = |id: &str| {
            vec![
                LlmEvent::ToolCallRequested(ToolCallRequest {
                    id: id.to_string(),
                    name: "get_working_hours".to_string(),
                    // Distinct arguments each round, so the memo never hides
                    // the budget check.
                    arguments: json!({"tenant_id": id}),
                }),
                LlmEvent::Done(FinishReason::ToolCalls),
            ]
        };
        let (engine, model, router) = engine_with(vec![
            tool_request("call_1"),
            tool_request("call_2"),
            tool_request("call_3"),
            tokens(&["Let ", "me ", "just ", "check ", "with ", "the ", "team."]),
        ]);
        let (speak_tx, _speak_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let outcome = engine.run_turn(request(), &speak_tx, &cancel).await;

        // Budget is 2: two executed calls, the third got a synthetic result.
        assert_eq!(outcome.tool_calls.len(), 2);
        assert_eq!(router.invocation_count(), 2);
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        let last_round = calls.last().unwrap();
        let tool_msg = last_round.last().unwrap();
        assert!(tool_msg["content"]
            .as_str()
            .unwrap()
            .contains("tool_budget_exhausted"));
    }

    #[tokio::test]
    async fn repeated_identical_call_hits_the_memo() {
        let tool_request = |id: &str| {
            vec![
                LlmEvent::ToolCallRequested(ToolCallRequest {
                    id: id.to_string(),
                    name: "get_working_hours".to_string(),
                    arguments: json!({"tenant_id": "acme-plumb"}),
                }),
                LlmEvent::Done(FinishReason::ToolCalls),
            ]
        };
        let (engine, _, router) = engine_with(vec![
            tool_request("call_1"),
            tool_request("call_2"),
            tokens(&["Nine ", "to ", "five."]),
        ]);
        let (speak_tx, _speak_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let outcome = engine.run_turn(request(), &speak_tx, &cancel).await;

        assert_eq!(outcome.tool_calls.len(), 2);
        // Only the first call reached the store; the second was served from
        // the per-turn memo with a byte-identical payload.
        assert_eq!(router.invocation_count(), 1);
        assert_eq!(
            outcome.tool_calls[0].outcome.to_llm_payload(),
            outcome.tool_calls[1].outcome.to_llm_payload()
        );
    }

    #[tokio::test]
    async fn missing_topic_asks_a_clarifying_question() {
        let round = vec![
            LlmEvent::ToolCallRequested(ToolCallRequest {
                id: "call_1".to_string(),
                name: "get_policies".to_string(),
                arguments: json!({"tenant_id": "acme-plumb"}),
            }),
            LlmEvent::Done(FinishReason::ToolCalls),
        ];
        let (engine, model, _) = engine_with(vec![round]);
        let (speak_tx, mut speak_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let outcome = engine.run_turn(request(), &speak_tx, &cancel).await;

        assert!(outcome.assistant_text.contains("Which topic"));
        // No second generation round: the engine answered directly.
        assert_eq!(model.calls.lock().unwrap().len(), 1);
        let commands = drain(&mut speak_rx).await;
        assert_eq!(commands.last(), Some(&TtsCommand::Flush));
    }

    #[tokio::test]
    async fn cancellation_discards_pending_buffer() {
        // An endless token stream; only cancellation ends it.
        let (tx, rx) = mpsc::channel::<LlmEvent>(4);
        struct EndlessModel {
            rx: Mutex<Option<mpsc::Receiver<LlmEvent>>>,
        }
        #[async_trait]
        impl LanguageModel for EndlessModel {
            async fn stream_chat(
                &self,
                _messages: Vec<Value>,
                _tools: Vec<Value>,
                _bounds: GenerationBounds,
            ) -> Result<mpsc::Receiver<LlmEvent>, LlmError> {
                Ok(self.rx.lock().unwrap().take().expect("single call"))
            }
        }

        let store = Arc::new(InMemoryTenantStore::new());
        let router = Arc::new(ToolRouter::new(store, Duration::from_millis(400)));
        let engine = ConversationEngine::new(
            Arc::new(EndlessModel {
                rx: Mutex::new(Some(rx)),
            }),
            router,
        );

        let (speak_tx, mut speak_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        tx.send(LlmEvent::Token("One moment".to_string())).await.unwrap();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            cancel_clone.cancel();
        });

        let outcome = engine.run_turn(request(), &speak_tx, &cancel).await;

        assert!(outcome.interrupted);
        assert_eq!(outcome.assistant_text, "One moment");
        // Nothing was flushed: the fragment never reached a boundary and
        // the run was cancelled.
        let commands = drain(&mut speak_rx).await;
        assert!(!commands.contains(&TtsCommand::Flush));
    }

    #[tokio::test]
    async fn llm_failure_speaks_fallback_line() {
        let (engine, _, _) = engine_with(vec![]);
        let (speak_tx, mut speak_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let outcome = engine.run_turn(request(), &speak_tx, &cancel).await;

        assert!(outcome.degraded);
        assert!(!outcome.interrupted);
        assert_eq!(outcome.assistant_text, LLM_TROUBLE_LINE);
        let commands = drain(&mut speak_rx).await;
        assert!(matches!(&commands[0], TtsCommand::Speak(t) if t == LLM_TROUBLE_LINE));
        assert_eq!(commands.last(), Some(&TtsCommand::Flush));
    }
}
