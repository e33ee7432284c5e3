// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! End-to-end call session scenarios.
//!
//! Each test drives a [`CallSession`] through its channel surface with a
//! scripted LLM, an echo TTS (every `Speak` yields audio, every `Flush`
//! yields `Flushed`), recording side-effect sinks, and a paused tokio
//! clock so debounce windows and timeouts elapse deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use frontdesk::engine::ConversationEngine;
use frontdesk::error::{LlmError, SinkError};
use frontdesk::events::{
    CallStartInfo, CarrierCommand, CarrierEvent, FinishReason, LlmEvent, SttEvent,
    ToolCallRequest, TtsCommand, TtsEvent,
};
use frontdesk::services::{GenerationBounds, LanguageModel};
use frontdesk::session::history::Role;
use frontdesk::session::{CallSession, SessionConfig, SessionDeps, SessionReport, TurnState};
use frontdesk::sinks::{BookingIntent, BookingSink, CallLogSink, CallRecord, SmsSink};
use frontdesk::tenant::store::{
    InMemoryTenantStore, PolicyEntry, TenantData, TenantRecord, TenantStore, WorkingHoursEntry,
};
use frontdesk::tenant::TenantSnapshot;
use frontdesk::tools::{ToolErrorTag, ToolOutcome, ToolRouter};

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

/// One generation round. `HoldOpen` keeps the stream alive after its events
/// so only cancellation (barge-in) can end the round.
enum Round {
    Events(Vec<LlmEvent>),
    HoldOpen(Vec<LlmEvent>),
}

struct ScriptedModel {
    rounds: Mutex<VecDeque<Round>>,
}

impl ScriptedModel {
    fn new(rounds: Vec<Round>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream_chat(
        &self,
        _messages: Vec<Value>,
        _tools: Vec<Value>,
        _bounds: GenerationBounds,
    ) -> Result<mpsc::Receiver<LlmEvent>, LlmError> {
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Http("script exhausted".to_string()))?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let (events, hold) = match round {
                Round::Events(events) => (events, false),
                Round::HoldOpen(events) => (events, true),
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if hold {
                // Keep the stream open until the engine drops the receiver.
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}

/// Tokens followed by a natural stop.
fn tokens(words: &[&str]) -> Round {
    let mut events: Vec<LlmEvent> = words.iter().map(|w| LlmEvent::Token(w.to_string())).collect();
    events.push(LlmEvent::Done(FinishReason::Stop));
    Round::Events(events)
}

/// A single tool request round.
fn tool_round(id: &str, name: &str, arguments: Value) -> Round {
    Round::Events(vec![
        LlmEvent::ToolCallRequested(ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }),
        LlmEvent::Done(FinishReason::ToolCalls),
    ])
}

// ---------------------------------------------------------------------------
// Recording sinks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSinks {
    bookings: Mutex<Vec<BookingIntent>>,
    smses: Mutex<Vec<(String, String)>>,
    call_logs: Mutex<Vec<CallRecord>>,
}

#[async_trait]
impl BookingSink for RecordingSinks {
    async fn create_booking(&self, intent: &BookingIntent) -> Result<String, SinkError> {
        self.bookings.lock().unwrap().push(intent.clone());
        Ok("bk-test-1".to_string())
    }
}

#[async_trait]
impl SmsSink for RecordingSinks {
    async fn send_confirmation(&self, to: &str, body: &str) -> Result<(), SinkError> {
        self.smses
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

#[async_trait]
impl CallLogSink for RecordingSinks {
    async fn record_call(&self, record: &CallRecord) -> Result<(), SinkError> {
        self.call_logs.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    carrier_events: mpsc::Sender<CarrierEvent>,
    carrier_commands: mpsc::Receiver<CarrierCommand>,
    stt_events: mpsc::Sender<SttEvent>,
    stt_audio: mpsc::Receiver<Vec<u8>>,
    sinks: Arc<RecordingSinks>,
    session: JoinHandle<SessionReport>,
}

impl Harness {
    /// Inject a final transcript followed by its utterance-end, then let
    /// the debounce window elapse.
    async fn utter(&self, text: &str) {
        self.say(text).await;
        self.utterance_end().await;
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    async fn say(&self, text: &str) {
        self.stt_events
            .send(SttEvent::Transcript {
                text: text.to_string(),
                is_final: true,
            })
            .await
            .unwrap();
    }

    async fn partial(&self, text: &str) {
        self.stt_events
            .send(SttEvent::Transcript {
                text: text.to_string(),
                is_final: false,
            })
            .await
            .unwrap();
    }

    async fn utterance_end(&self) {
        self.stt_events.send(SttEvent::UtteranceEnd).await.unwrap();
    }

    /// Drain every carrier command seen so far.
    fn drain_commands(&mut self) -> Vec<CarrierCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.carrier_commands.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// Stop the stream and wait for the session report.
    async fn hang_up(self) -> SessionReport {
        let _ = self.carrier_events.send(CarrierEvent::Stop).await;
        self.session.await.expect("session task must not panic")
    }

    /// Wait for the session to end on its own (farewell path).
    async fn wait_report(self) -> SessionReport {
        self.session.await.expect("session task must not panic")
    }
}

fn default_store() -> Arc<InMemoryTenantStore> {
    let store = Arc::new(InMemoryTenantStore::new());
    store.insert(TenantData {
        record: TenantRecord {
            tenant_id: "acme-plumb".to_string(),
            display_name: "Acme Plumbing".to_string(),
            industry: "plumbing".to_string(),
            ..TenantRecord::default()
        },
        working_hours: vec![WorkingHoursEntry {
            day: "Monday".to_string(),
            hours: "8am-4pm".to_string(),
        }],
        policies: vec![PolicyEntry {
            topic: "cancellation".to_string(),
            content: "24 hours notice".to_string(),
        }],
        ..TenantData::default()
    });
    store
}

fn acme_tenant() -> Arc<TenantSnapshot> {
    Arc::new(TenantSnapshot::from_record(TenantRecord {
        tenant_id: "acme-plumb".to_string(),
        display_name: "Acme Plumbing".to_string(),
        industry: "plumbing".to_string(),
        ..TenantRecord::default()
    }))
}

fn spawn_session(
    tenant: Arc<TenantSnapshot>,
    rounds: Vec<Round>,
    store: Arc<dyn TenantStore>,
) -> Harness {
    spawn_session_with_flush_delay(tenant, rounds, store, Duration::ZERO)
}

fn spawn_session_with_flush_delay(
    tenant: Arc<TenantSnapshot>,
    rounds: Vec<Round>,
    store: Arc<dyn TenantStore>,
    flush_delay: Duration,
) -> Harness {
    let (carrier_event_tx, carrier_event_rx) = mpsc::channel(256);
    let (carrier_command_tx, carrier_command_rx) = mpsc::channel(256);
    let (stt_audio_tx, stt_audio_rx) = mpsc::channel(512);
    let (stt_event_tx, stt_event_rx) = mpsc::channel(256);
    let (tts_command_tx, mut tts_command_rx) = mpsc::channel::<TtsCommand>(256);
    let (tts_event_tx, tts_event_rx) = mpsc::channel(256);

    // Echo TTS: each fragment becomes audio immediately, each flush is
    // confirmed. Mirrors the provider contract without a socket.
    tokio::spawn(async move {
        while let Some(command) = tts_command_rx.recv().await {
            match command {
                TtsCommand::Speak(text) => {
                    let audio = vec![0xFFu8; text.len().max(1)];
                    if tts_event_tx.send(TtsEvent::Audio(audio)).await.is_err() {
                        break;
                    }
                }
                TtsCommand::Flush => {
                    if !flush_delay.is_zero() {
                        tokio::time::sleep(flush_delay).await;
                    }
                    if tts_event_tx.send(TtsEvent::Flushed).await.is_err() {
                        break;
                    }
                }
                TtsCommand::Clear => {}
                TtsCommand::Close => break,
            }
        }
    });

    let sinks = Arc::new(RecordingSinks::default());
    let model = Arc::new(ScriptedModel::new(rounds));
    let router = Arc::new(ToolRouter::new(store, Duration::from_millis(400)));
    let engine = Arc::new(ConversationEngine::new(model, router));

    let deps = SessionDeps {
        carrier_rx: carrier_event_rx,
        carrier_tx: carrier_command_tx,
        stt_audio_tx,
        stt_events: stt_event_rx,
        tts_commands: tts_command_tx,
        tts_events: tts_event_rx,
        engine,
        booking_sink: sinks.clone(),
        sms_sink: sinks.clone(),
        call_log: sinks.clone(),
    };

    let start = CallStartInfo {
        stream_sid: "MZ1".to_string(),
        tenant_id: Some(tenant.tenant_id.clone()),
        caller_phone: Some("+61400000001".to_string()),
        call_id: Some("CA1".to_string()),
        dialed_number: None,
    };

    let session = CallSession::new(
        "CA1",
        start,
        tenant,
        SessionConfig::default(),
        deps,
        CancellationToken::new(),
    );

    Harness {
        carrier_events: carrier_event_tx,
        carrier_commands: carrier_command_rx,
        stt_events: stt_event_tx,
        stt_audio: stt_audio_rx,
        sinks,
        session: tokio::spawn(session.run()),
    }
}

/// Let the greeting play out before driving the call.
async fn settle_greeting() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ---------------------------------------------------------------------------
// Scenario 1: happy-path booking
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn happy_path_booking() {
    let harness = spawn_session(
        acme_tenant(),
        vec![
            tokens(&["Is it completely blocked ", "or draining slowly?"]),
            tokens(&["Could I get the address ", "and a time window?"]),
            tool_round(
                "call_1",
                "get_working_hours",
                json!({"tenant_id": "acme-plumb"}),
            ),
            tokens(&["Booked for tomorrow ", "at 9 AM."]),
        ],
        default_store(),
    );
    settle_greeting().await;

    harness
        .carrier_events
        .send(CarrierEvent::Media(vec![0xFF; 160]))
        .await
        .unwrap();

    harness.utter("Hi, my kitchen sink is blocked.").await;
    harness.utter("Completely blocked").await;
    harness.utter("123 George St, tomorrow morning").await;
    harness.utter("Thanks, bye").await;

    let report = harness.wait_report().await;

    assert_eq!(report.history.assistant_turns(), 4);
    assert_eq!(report.history.user_turns(), 4);
    assert_eq!(report.history.tool_calls(), 1);
    assert!(report.history.alternation_ok());
    assert!(report.history.seq_monotonic());
    assert_eq!(report.metrics.barge_ins, 0);
    assert_eq!(report.metrics.tool_calls, 1);
    assert_eq!(report.final_state, TurnState::Ending);
    assert_eq!(report.booking_reference.as_deref(), Some("bk-test-1"));
}

#[tokio::test(start_paused = true)]
async fn happy_path_booking_side_effects() {
    let harness = spawn_session(
        acme_tenant(),
        vec![
            tokens(&["Which service ", "do you need?"]),
            tokens(&["Booked for tomorrow ", "at 9 AM."]),
        ],
        default_store(),
    );
    settle_greeting().await;

    harness.utter("My name is Sam, sink is blocked").await;
    harness.utter("Tomorrow morning works").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let bookings = harness.sinks.bookings.lock().unwrap().clone();
    let smses = harness.sinks.smses.lock().unwrap().clone();
    assert_eq!(bookings.len(), 1, "booking sink invoked exactly once");
    assert_eq!(bookings[0].customer_name, "Sam");
    assert_eq!(bookings[0].tenant_id, "acme-plumb");
    assert_eq!(smses.len(), 1, "sms sink invoked exactly once");
    assert_eq!(smses[0].0, "+61400000001");
    assert!(smses[0].1.contains("bk-test-1"));

    let sinks = harness.sinks.clone();
    let report = harness.hang_up().await;
    assert_eq!(report.booking_reference.as_deref(), Some("bk-test-1"));
    assert_eq!(report.metrics.sink_failures, 0);

    // The call log lands at cleanup with the booked outcome.
    let call_logs = sinks.call_logs.lock().unwrap();
    assert_eq!(call_logs.len(), 1);
    assert_eq!(call_logs[0].outcome, "booked");
    assert!(call_logs[0].transcript.contains("Customer: My name is Sam"));
}

// ---------------------------------------------------------------------------
// Scenario 2: rapid duplicate UtteranceEnd
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn duplicate_utterance_end_runs_engine_once() {
    let harness = spawn_session(
        acme_tenant(),
        vec![
            tool_round(
                "call_1",
                "get_working_hours",
                json!({"tenant_id": "acme-plumb"}),
            ),
            tokens(&["We're open ", "Monday, eight to four."]),
        ],
        default_store(),
    );
    settle_greeting().await;

    harness.say("What are your hours?").await;
    harness.utterance_end().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.utterance_end().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let report = harness.hang_up().await;

    // Exactly one engine run: greeting plus one assistant turn.
    assert_eq!(report.history.assistant_turns(), 2);
    assert_eq!(report.history.user_turns(), 1);
    assert_eq!(report.metrics.utterances, 1);
    assert!(report.history.tool_calls() <= 1);
}

#[tokio::test(start_paused = true)]
async fn spaced_utterance_ends_run_engine_twice() {
    let harness = spawn_session(
        acme_tenant(),
        vec![
            tokens(&["We're open ", "eight to four."]),
            tokens(&["No worries ", "at all."]),
        ],
        default_store(),
    );
    settle_greeting().await;

    harness.say("What are your hours?").await;
    harness.utterance_end().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.say("Great, thank you").await;
    harness.utterance_end().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let report = harness.hang_up().await;

    assert_eq!(report.history.assistant_turns(), 3);
    assert_eq!(report.history.user_turns(), 2);
    assert_eq!(report.metrics.utterances, 2);
}

// ---------------------------------------------------------------------------
// Scenario 3: barge-in mid-response
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn barge_in_clears_and_cancels() {
    let mut harness = spawn_session(
        acme_tenant(),
        vec![
            // A long answer that never finishes on its own.
            Round::HoldOpen(vec![
                LlmEvent::Token("Let me explain ".to_string()),
                LlmEvent::Token("everything about our services. ".to_string()),
            ]),
            tokens(&["Sure, what time ", "suits you?"]),
        ],
        default_store(),
    );
    settle_greeting().await;

    harness.say("Tell me about your services").await;
    harness.utterance_end().await;
    // Debounce fires, the engine starts streaming, audio flows.
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.drain_commands();

    // 12-character partial: over the threshold.
    harness.partial("wait hold on").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let commands = harness.drain_commands();
    let clears = commands
        .iter()
        .filter(|c| matches!(c, CarrierCommand::Clear))
        .count();
    assert_eq!(clears, 1, "exactly one clear on barge-in");
    // No audio of the interrupted turn after the clear.
    assert!(
        !commands
            .iter()
            .skip_while(|c| !matches!(c, CarrierCommand::Clear))
            .any(|c| matches!(c, CarrierCommand::Audio(_))),
        "no further audio frames of the interrupted turn"
    );

    // The caller goes on; the next turn answers the new utterance.
    harness.utter("Actually, can I book for three?").await;

    let report = harness.hang_up().await;
    assert_eq!(report.metrics.barge_ins, 1);
    assert!(report.history.alternation_ok());
    let interrupted: Vec<_> = report
        .history
        .turns()
        .iter()
        .filter(|t| t.role == Role::Assistant && t.interrupted)
        .collect();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(
        report.history.last_assistant_text(),
        Some("Sure, what time suits you?")
    );
}

#[tokio::test(start_paused = true)]
async fn short_partial_does_not_barge_in() {
    let mut harness = spawn_session(
        acme_tenant(),
        vec![Round::HoldOpen(vec![
            LlmEvent::Token("Here's the full rundown. ".to_string()),
        ])],
        default_store(),
    );
    settle_greeting().await;

    harness.say("Tell me about your services").await;
    harness.utterance_end().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.drain_commands();

    // Length 5: below the barge-in threshold.
    harness.partial("12345").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let commands = harness.drain_commands();
    assert!(
        !commands.iter().any(|c| matches!(c, CarrierCommand::Clear)),
        "five characters must not trigger barge-in"
    );

    // Length 6: over the threshold.
    harness.partial("123456").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let commands = harness.drain_commands();
    assert!(
        commands.iter().any(|c| matches!(c, CarrierCommand::Clear)),
        "six characters must trigger barge-in"
    );

    let report = harness.hang_up().await;
    assert_eq!(report.metrics.barge_ins, 1);
}

// ---------------------------------------------------------------------------
// Scenario 4: tool timeout
// ---------------------------------------------------------------------------

/// A store whose policy lookups hang well past the tool time box.
struct SlowPolicyStore {
    inner: Arc<InMemoryTenantStore>,
}

#[async_trait]
impl TenantStore for SlowPolicyStore {
    async fn tenant_by_id(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantRecord>, frontdesk::error::StoreError> {
        self.inner.tenant_by_id(tenant_id).await
    }
    async fn tenant_by_number(
        &self,
        number: &str,
    ) -> Result<Option<TenantRecord>, frontdesk::error::StoreError> {
        self.inner.tenant_by_number(number).await
    }
    async fn latest_booking(
        &self,
        tenant_id: &str,
        customer_phone: &str,
    ) -> Result<Option<frontdesk::tenant::store::BookingRecord>, frontdesk::error::StoreError>
    {
        self.inner.latest_booking(tenant_id, customer_phone).await
    }
    async fn booking_by_id(
        &self,
        tenant_id: &str,
        booking_id: &str,
    ) -> Result<Option<frontdesk::tenant::store::BookingRecord>, frontdesk::error::StoreError>
    {
        self.inner.booking_by_id(tenant_id, booking_id).await
    }
    async fn services(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<frontdesk::tenant::store::ServiceEntry>, frontdesk::error::StoreError> {
        self.inner.services(tenant_id).await
    }
    async fn working_hours(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<WorkingHoursEntry>, frontdesk::error::StoreError> {
        self.inner.working_hours(tenant_id).await
    }
    async fn policies(
        &self,
        tenant_id: &str,
        topic: &str,
    ) -> Result<Vec<PolicyEntry>, frontdesk::error::StoreError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.inner.policies(tenant_id, topic).await
    }
    async fn faqs(
        &self,
        tenant_id: &str,
        topic: &str,
    ) -> Result<Vec<frontdesk::tenant::store::FaqEntry>, frontdesk::error::StoreError> {
        self.inner.faqs(tenant_id, topic).await
    }
}

#[tokio::test(start_paused = true)]
async fn tool_timeout_degrades_to_offer() {
    let harness = spawn_session(
        acme_tenant(),
        vec![
            tool_round(
                "call_1",
                "get_policies",
                json!({"tenant_id": "acme-plumb", "topic": "cancellation"}),
            ),
            tokens(&[
                "I couldn't check that just now. ",
                "Would you like me to take a message?",
            ]),
        ],
        Arc::new(SlowPolicyStore {
            inner: default_store(),
        }),
    );
    settle_greeting().await;

    harness.utter("What's your cancellation policy?").await;

    let report = harness.hang_up().await;

    let timeout_records: Vec<_> = report
        .history
        .turns()
        .iter()
        .filter_map(|t| t.tool_call.as_ref())
        .filter(|r| r.outcome == ToolOutcome::Error(ToolErrorTag::Timeout))
        .collect();
    assert_eq!(timeout_records.len(), 1, "the tool call timed out");
    assert!(report
        .history
        .last_assistant_text()
        .unwrap()
        .contains("take a message"));
    // The call ended because we hung up, not because the tool failed.
    assert_eq!(report.final_state, TurnState::Ending);
    assert_eq!(report.history.assistant_turns(), 2);
}

// ---------------------------------------------------------------------------
// Scenario 5: STT drop and reconnect
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stt_reconnect_is_survivable() {
    let mut harness = spawn_session(
        acme_tenant(),
        vec![tokens(&["We're open ", "eight to four."])],
        default_store(),
    );
    settle_greeting().await;

    // Audio flows before the drop.
    harness
        .carrier_events
        .send(CarrierEvent::Media(vec![0xFF; 160]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.stt_audio.try_recv().unwrap().len(), 160);

    harness.stt_events.send(SttEvent::Disconnected).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.stt_events.send(SttEvent::Reconnected).await.unwrap();

    // Transcription resumes after the reconnect.
    harness.utter("What are your hours?").await;

    let report = harness.hang_up().await;
    assert_eq!(report.metrics.stt_reconnects, 1);
    assert_eq!(report.history.assistant_turns(), 2);
    assert_eq!(
        report.history.last_assistant_text(),
        Some("We're open eight to four.")
    );
}

// ---------------------------------------------------------------------------
// Scenario 6: unknown tenant
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unknown_tenant_degrades_gracefully() {
    let harness = spawn_session(
        Arc::new(TenantSnapshot::fallback()),
        vec![
            tool_round(
                "call_1",
                "get_working_hours",
                json!({"tenant_id": "unknown"}),
            ),
            tokens(&["I can't check that right now, ", "sorry about that!"]),
        ],
        default_store(),
    );
    settle_greeting().await;

    harness.utter("What are your hours?").await;

    let report = harness.hang_up().await;

    // Generic greeting template.
    let greeting = &report.history.turns()[1];
    assert_eq!(greeting.role, Role::Assistant);
    assert!(greeting.content.contains("our business"));

    // Tenant-scoped data comes back NotFound under the fallback snapshot.
    let not_found: Vec<_> = report
        .history
        .turns()
        .iter()
        .filter_map(|t| t.tool_call.as_ref())
        .filter(|r| r.outcome == ToolOutcome::Error(ToolErrorTag::NotFound))
        .collect();
    assert_eq!(not_found.len(), 1);
    assert_eq!(report.history.assistant_turns(), 2);
    assert_eq!(report.final_state, TurnState::Ending);
}

// ---------------------------------------------------------------------------
// Farewell boundaries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn thanks_alone_does_not_end_the_call() {
    let harness = spawn_session(
        acme_tenant(),
        vec![tokens(&["You're very ", "welcome!"])],
        default_store(),
    );
    settle_greeting().await;

    harness.utter("thanks").await;

    // The session is still alive: the engine answered and awaits more.
    let report = harness.hang_up().await;
    assert_eq!(report.history.assistant_turns(), 2);
    assert_eq!(report.history.user_turns(), 1);
}

#[tokio::test(start_paused = true)]
async fn bye_ends_the_call_without_an_engine_run() {
    let harness = spawn_session(acme_tenant(), vec![], default_store());
    settle_greeting().await;

    harness.utter("bye").await;

    let report = harness.wait_report().await;
    // No engine run for the farewell: the greeting is the only assistant
    // turn, and the scripted model was never consulted.
    assert_eq!(report.history.assistant_turns(), 1);
    assert_eq!(report.history.user_turns(), 1);
    assert_eq!(report.final_state, TurnState::Ending);
}

#[tokio::test(start_paused = true)]
async fn new_speech_cancels_a_pending_end() {
    // Flush confirmations take two seconds, so the farewell end stays
    // pending long enough for the caller to change their mind.
    let harness = spawn_session_with_flush_delay(
        acme_tenant(),
        vec![
            tokens(&["We're open ", "eight to four."]),
            tokens(&["Happy to help ", "with the drain."]),
        ],
        default_store(),
        Duration::from_secs(2),
    );
    settle_greeting().await;

    harness.utter("What are your hours?").await;

    // Farewell while the response flush is still unconfirmed: the end is
    // scheduled, not executed.
    harness.say("that's all").await;
    harness.utterance_end().await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The caller changes their mind inside the grace window.
    harness.say("wait, one more thing about my drain").await;
    harness.utterance_end().await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let report = harness.hang_up().await;
    // The cancelled farewell was dropped, the follow-up got its answer,
    // and the history still alternates.
    assert_eq!(
        report.history.last_assistant_text(),
        Some("Happy to help with the drain.")
    );
    assert!(report.history.alternation_ok());
    assert_eq!(report.history.user_turns(), 2);
    assert_eq!(report.final_state, TurnState::Ending);
}

// ---------------------------------------------------------------------------
// Hot path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn media_frames_reach_stt_promptly() {
    let mut harness = spawn_session(acme_tenant(), vec![], default_store());
    settle_greeting().await;

    let frame = vec![0x55u8; 160];
    harness
        .carrier_events
        .send(CarrierEvent::Media(frame.clone()))
        .await
        .unwrap();
    // Well inside the 100 ms budget.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.stt_audio.try_recv().unwrap(), frame);

    let report = harness.hang_up().await;
    assert_eq!(report.metrics.audio_bytes_in, 160);
}
