// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Per-call session: the turn-taking state machine.
//!
//! A session owns everything that happens between WebSocket accept and
//! close: the greeting, the debounced hand-off from STT utterance-ends to
//! engine runs, barge-in, farewell detection, the idle guard, side-effect
//! dispatch, and cleanup. Its event loop is the single writer of the
//! conversation history and the single consumer of every inbound channel,
//! so per-session ordering needs no further locking.
//!
//! Turn states:
//!
//! ```text
//!            greeting emitted
//!    ┌──────────────────────────► AISpeaking
//!    │                                │ TTS Flushed
//!    │                                ▼
//!    │                              Idle ◄────────── debounce fires (no active task)
//!    │                                │
//!    │   inbound audio yields         │ final transcript / UtteranceEnd
//!    │   first partial transcript     ▼
//!    │                           UserSpeaking
//!    │                                │ UtteranceEnd (debounced)
//!    │                                ▼
//!    │                            Thinking
//!    │                                │ first TTS audio frame
//!    └────────────────────────────────┘
//! ```
//!
//! `Ending` is enterable from any state and absorbing.

pub mod history;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{prompt, ConversationEngine, TurnOutcome, TurnRequest};
use crate::events::{
    CallStartInfo, CarrierCommand, CarrierEvent, SttEvent, TtsCommand, TtsEvent,
};
use crate::session::history::ConversationHistory;
use crate::session::metrics::CallMetrics;
use crate::sinks::{BookingSink, CallLogSink, CallRecord, SmsSink};
use crate::tenant::TenantSnapshot;

/// Spoken on the degraded path before a graceful hang-up.
pub const DEGRADED_LINE: &str = "I'm having trouble; would you like me to take a message?";

/// Mark name used to detect when the greeting finished playing.
const GREETING_MARK: &str = "greeting";

/// Turn-taking states. See the module diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    UserSpeaking,
    Thinking,
    AISpeaking,
    Ending,
}

/// Session timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Grace window coalescing rapid utterance-end signals.
    pub debounce_window: Duration,
    /// End the call after this long with no audio in either direction.
    pub idle_timeout: Duration,
    /// Absolute fail-safe between farewell detection and hang-up.
    pub end_grace: Duration,
    /// A partial transcript longer than this many characters (cleaned)
    /// interrupts the assistant.
    pub barge_in_min_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
            end_grace: Duration::from_secs(8),
            barge_in_min_chars: 5,
        }
    }
}

/// Channel surfaces and collaborators handed to a session at construction.
/// Production wires these to real provider clients; tests inject harnesses.
pub struct SessionDeps {
    pub carrier_rx: mpsc::Receiver<CarrierEvent>,
    pub carrier_tx: mpsc::Sender<CarrierCommand>,
    pub stt_audio_tx: mpsc::Sender<Vec<u8>>,
    pub stt_events: mpsc::Receiver<SttEvent>,
    pub tts_commands: mpsc::Sender<TtsCommand>,
    pub tts_events: mpsc::Receiver<TtsEvent>,
    pub engine: Arc<ConversationEngine>,
    pub booking_sink: Arc<dyn BookingSink>,
    pub sms_sink: Arc<dyn SmsSink>,
    pub call_log: Arc<dyn CallLogSink>,
}

/// What the session hands back when its loop ends.
#[derive(Debug)]
pub struct SessionReport {
    pub history: ConversationHistory,
    pub metrics: CallMetrics,
    pub final_state: TurnState,
    pub booking_reference: Option<String>,
}

/// Internal wake-ups routed through the session's own channel so that the
/// event loop stays the single writer.
enum SessionSignal {
    DebounceFired(u64),
    EngineDone(TurnOutcome),
    EndDeadline,
}

/// Farewell detection: explicit endings only. Politeness tokens alone
/// ("thanks") never end the call.
pub(crate) fn is_farewell(text: &str) -> bool {
    let lower = text.to_lowercase();
    const PHRASES: [&str; 3] = ["that's all", "that's it", "nothing else"];
    if PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_alphabetic())
        .any(|word| matches!(word, "bye" | "goodbye"))
}

// ---------------------------------------------------------------------------
// CallSession
// ---------------------------------------------------------------------------

/// State for one live call.
pub struct CallSession {
    call_id: String,
    start: CallStartInfo,
    tenant: Arc<TenantSnapshot>,
    config: SessionConfig,
    cancel: CancellationToken,

    carrier_rx: Option<mpsc::Receiver<CarrierEvent>>,
    carrier_tx: mpsc::Sender<CarrierCommand>,
    stt_audio_tx: mpsc::Sender<Vec<u8>>,
    stt_events: Option<mpsc::Receiver<SttEvent>>,
    tts_commands: mpsc::Sender<TtsCommand>,
    tts_events: Option<mpsc::Receiver<TtsEvent>>,
    engine: Arc<ConversationEngine>,
    booking_sink: Arc<dyn BookingSink>,
    sms_sink: Arc<dyn SmsSink>,
    call_log: Arc<dyn CallLogSink>,

    state: TurnState,
    history: ConversationHistory,
    metrics: CallMetrics,
    current_transcript: String,

    /// Single-flight guard: an engine run holds this for its whole life.
    llm_lock: Arc<tokio::sync::Mutex<()>>,
    engine_running: bool,
    /// One queued slot for work that arrived while a run was active.
    run_queued: bool,
    engine_cancel: Option<CancellationToken>,

    debounce_generation: u64,
    debounce_handle: Option<JoinHandle<()>>,

    end_pending: bool,
    end_deadline_handle: Option<JoinHandle<()>>,
    /// Flush commands sent to TTS that have not yet been confirmed. Call
    /// end waits for this to reach zero (or for the fail-safe).
    flushes_outstanding: u32,

    booking_dispatched: bool,
    booking_reference: Option<String>,

    /// Closed on barge-in so stale TTS audio never reaches the carrier.
    tts_gate_open: bool,
    last_audio_activity: Instant,
    stt_closed: bool,
    tts_closed: bool,

    signal_tx: mpsc::Sender<SessionSignal>,
    signal_rx: Option<mpsc::Receiver<SessionSignal>>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        start: CallStartInfo,
        tenant: Arc<TenantSnapshot>,
        config: SessionConfig,
        deps: SessionDeps,
        cancel: CancellationToken,
    ) -> Self {
        let call_id = call_id.into();
        let (signal_tx, signal_rx) = mpsc::channel(64);
        Self {
            metrics: CallMetrics::new(call_id.clone()),
            call_id,
            start,
            tenant,
            config,
            cancel,
            carrier_rx: Some(deps.carrier_rx),
            carrier_tx: deps.carrier_tx,
            stt_audio_tx: deps.stt_audio_tx,
            stt_events: Some(deps.stt_events),
            tts_commands: deps.tts_commands,
            tts_events: Some(deps.tts_events),
            engine: deps.engine,
            booking_sink: deps.booking_sink,
            sms_sink: deps.sms_sink,
            call_log: deps.call_log,
            state: TurnState::Idle,
            history: ConversationHistory::new(),
            current_transcript: String::new(),
            llm_lock: Arc::new(tokio::sync::Mutex::new(())),
            engine_running: false,
            run_queued: false,
            engine_cancel: None,
            debounce_generation: 0,
            debounce_handle: None,
            end_pending: false,
            end_deadline_handle: None,
            flushes_outstanding: 0,
            booking_dispatched: false,
            booking_reference: None,
            tts_gate_open: true,
            last_audio_activity: Instant::now(),
            stt_closed: false,
            tts_closed: false,
            signal_tx,
            signal_rx: Some(signal_rx),
        }
    }

    /// Drive the call to completion. Returns the sealed report.
    pub async fn run(mut self) -> SessionReport {
        info!(call_id = %self.call_id, tenant = %self.tenant.tenant_id, "Call session started");

        self.history
            .push_system(prompt::render_system_prompt(&self.tenant));
        self.play_greeting().await;

        let cancel = self.cancel.clone();
        let mut carrier_rx = self.carrier_rx.take().expect("run called once");
        let mut stt_events = self.stt_events.take().expect("run called once");
        let mut tts_events = self.tts_events.take().expect("run called once");
        let mut signal_rx = self.signal_rx.take().expect("run called once");

        self.last_audio_activity = Instant::now();

        loop {
            let idle_deadline = self.last_audio_activity + self.config.idle_timeout;
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.begin_ending("shutdown").await;
                    break;
                }
                event = carrier_rx.recv() => match event {
                    Some(event) => {
                        if self.on_carrier_event(event).await {
                            break;
                        }
                    }
                    None => {
                        info!(call_id = %self.call_id, "Carrier channel closed");
                        break;
                    }
                },
                event = stt_events.recv(), if !self.stt_closed => match event {
                    Some(event) => self.on_stt_event(event).await,
                    None => {
                        self.stt_closed = true;
                        self.on_provider_unavailable("stt").await;
                    }
                },
                event = tts_events.recv(), if !self.tts_closed => match event {
                    Some(event) => {
                        if self.on_tts_event(event).await {
                            break;
                        }
                    }
                    None => {
                        // Without TTS the caller can only hear silence; end
                        // straight away rather than waiting out the guard.
                        self.tts_closed = true;
                        error!(call_id = %self.call_id, "tts provider unavailable");
                        self.begin_ending("tts unavailable").await;
                        break;
                    }
                },
                signal = signal_rx.recv() => {
                    if let Some(signal) = signal {
                        if self.on_signal(signal).await {
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    warn!(call_id = %self.call_id, "Idle guard fired, ending call");
                    self.begin_ending("idle").await;
                    break;
                }
            }
        }

        self.cleanup().await
    }

    // -----------------------------------------------------------------------
    // Greeting
    // -----------------------------------------------------------------------

    /// Replay the pre-rendered greeting when the tenant has one, otherwise
    /// synthesize the greeting text. Either way the greeting turn lands in
    /// history and the session enters `AISpeaking`.
    async fn play_greeting(&mut self) {
        let greeting = self.tenant.greeting_text.clone();
        match self.tenant.greeting_audio.clone() {
            Some(audio) => {
                self.metrics.on_audio_out(audio.len());
                let _ = self.carrier_tx.send(CarrierCommand::Audio(audio)).await;
                // The carrier echoes the mark when playback reaches it,
                // which is our cue to leave AISpeaking.
                let _ = self
                    .carrier_tx
                    .send(CarrierCommand::Mark(GREETING_MARK.to_string()))
                    .await;
            }
            None => {
                let _ = self
                    .tts_commands
                    .send(TtsCommand::Speak(greeting.clone()))
                    .await;
                let _ = self.tts_commands.send(TtsCommand::Flush).await;
                self.flushes_outstanding += 1;
            }
        }
        debug!(call_id = %self.call_id, "Greeting emitted");
        self.history.push_assistant(greeting, false);
        self.state = TurnState::AISpeaking;
    }

    // -----------------------------------------------------------------------
    // Carrier events
    // -----------------------------------------------------------------------

    async fn on_carrier_event(&mut self, event: CarrierEvent) -> bool {
        match event {
            CarrierEvent::Connected => {
                debug!(call_id = %self.call_id, "Carrier connected");
                false
            }
            CarrierEvent::Start(_) => {
                // The accept phase consumed the real start event; a repeat
                // is harmless.
                debug!(call_id = %self.call_id, "Duplicate start event");
                false
            }
            CarrierEvent::Media(frame) => {
                self.metrics.on_audio_in(frame.len());
                self.last_audio_activity = Instant::now();
                if !self.stt_closed && self.stt_audio_tx.try_send(frame).is_err() {
                    self.metrics.dropped_frames += 1;
                }
                false
            }
            CarrierEvent::Mark(name) => {
                if name == GREETING_MARK
                    && self.state == TurnState::AISpeaking
                    && !self.engine_running
                {
                    self.state = TurnState::Idle;
                }
                false
            }
            CarrierEvent::Stop => {
                info!(call_id = %self.call_id, "Carrier stopped the stream");
                true
            }
            CarrierEvent::ConnectionLost => {
                info!(call_id = %self.call_id, "Carrier connection lost");
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // STT events
    // -----------------------------------------------------------------------

    async fn on_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Transcript { text, is_final: true } => {
                self.metrics.on_first_transcript();
                self.cancel_pending_end();
                debug!(call_id = %self.call_id, text = %text, "Final transcript");
                if self.current_transcript.is_empty() {
                    self.current_transcript = text;
                } else {
                    self.current_transcript.push(' ');
                    self.current_transcript.push_str(&text);
                }
                if self.state == TurnState::Idle {
                    self.state = TurnState::UserSpeaking;
                }
            }
            SttEvent::Transcript { text, is_final: false } => {
                let cleaned = text.trim();
                match self.state {
                    TurnState::AISpeaking | TurnState::Thinking
                        if cleaned.chars().count() > self.config.barge_in_min_chars =>
                    {
                        info!(call_id = %self.call_id, text = %cleaned, "Barge-in");
                        self.barge_in().await;
                    }
                    TurnState::Idle => self.state = TurnState::UserSpeaking,
                    _ => {}
                }
            }
            SttEvent::UtteranceEnd => {
                if self.current_transcript.trim().is_empty() {
                    debug!(call_id = %self.call_id, "Utterance end with no transcript");
                } else if self.state != TurnState::Ending {
                    self.schedule_debounce();
                }
            }
            SttEvent::SpeechStarted => {
                if self.state == TurnState::Idle {
                    self.state = TurnState::UserSpeaking;
                }
            }
            SttEvent::Disconnected => {
                warn!(call_id = %self.call_id, "STT disconnected, client is retrying");
            }
            SttEvent::Reconnected => {
                self.metrics.stt_reconnects += 1;
            }
        }
    }

    /// Interrupt the assistant: clear carrier playback, drop in-flight
    /// synthesis, cancel the engine scope. STT, TTS, and the carrier all
    /// survive; only the engine scope dies.
    async fn barge_in(&mut self) {
        self.metrics.barge_ins += 1;
        // try_send keeps the clear inside the current loop tick.
        let _ = self.carrier_tx.try_send(CarrierCommand::Clear);
        self.tts_gate_open = false;
        let _ = self.tts_commands.try_send(TtsCommand::Clear);
        if let Some(cancel) = self.engine_cancel.take() {
            cancel.cancel();
        }
        self.state = TurnState::UserSpeaking;
        self.cancel_pending_end();
    }

    // -----------------------------------------------------------------------
    // Debounce + single-flight
    // -----------------------------------------------------------------------

    /// (Re)arm the debounce timer. The stale timer is always cancelled
    /// first, and any queued engine work is dropped: the new utterance will
    /// decide what runs next.
    fn schedule_debounce(&mut self) {
        self.debounce_generation += 1;
        let generation = self.debounce_generation;
        if let Some(handle) = self.debounce_handle.take() {
            handle.abort();
        }
        self.run_queued = false;

        let signal_tx = self.signal_tx.clone();
        let window = self.config.debounce_window;
        self.debounce_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = signal_tx.send(SessionSignal::DebounceFired(generation)).await;
        }));
    }

    async fn on_signal(&mut self, signal: SessionSignal) -> bool {
        match signal {
            SessionSignal::DebounceFired(generation) => {
                if generation != self.debounce_generation || self.state == TurnState::Ending {
                    return false;
                }
                self.debounce_handle = None;
                if self.engine_running {
                    // The prior turn is still finalizing; this utterance
                    // waits in line rather than being dropped.
                    self.run_queued = true;
                    false
                } else {
                    self.handle_debounced_utterance().await
                }
            }
            SessionSignal::EngineDone(outcome) => self.on_engine_done(outcome).await,
            SessionSignal::EndDeadline => {
                if self.end_pending {
                    self.seal_farewell();
                    self.begin_ending("farewell fail-safe").await;
                    return true;
                }
                false
            }
        }
    }

    /// Act on a debounced utterance: an explicit farewell schedules the
    /// call end, anything else is sealed as a user turn and handed to the
    /// engine. Returns true when the session loop should stop.
    ///
    /// A farewell is NOT sealed here: it stays in the transcript buffer
    /// until the end actually fires, so that a caller who changes their
    /// mind never leaves two consecutive user turns in history.
    async fn handle_debounced_utterance(&mut self) -> bool {
        let utterance = self.current_transcript.trim().to_string();
        if utterance.is_empty() {
            return false;
        }

        if is_farewell(&utterance) {
            info!(call_id = %self.call_id, utterance = %utterance, "Farewell detected");
            self.end_pending = true;
            self.schedule_end_deadline();
            if self.flushes_outstanding == 0 && !self.engine_running {
                self.seal_farewell();
                self.begin_ending("farewell").await;
                return true;
            }
            return false;
        }

        self.current_transcript.clear();
        self.metrics.utterances += 1;
        self.history.push_user(utterance.clone());
        info!(call_id = %self.call_id, utterance = %utterance, "Starting engine run");
        self.launch_engine();
        false
    }

    /// Commit the farewell utterance as the final user turn.
    fn seal_farewell(&mut self) {
        let utterance = self.current_transcript.trim().to_string();
        self.current_transcript.clear();
        if !utterance.is_empty() {
            self.metrics.utterances += 1;
            self.history.push_user(utterance);
        }
    }

    /// Spawn the engine task under the single-flight lock. The latest user
    /// turn is already sealed.
    fn launch_engine(&mut self) {
        self.state = TurnState::Thinking;
        self.tts_gate_open = true;

        let request = TurnRequest {
            messages: self.history.to_messages(),
            tenant: self.tenant.clone(),
            caller_phone: self.start.caller_phone.clone(),
        };
        let cancel = self.cancel.child_token();
        self.engine_cancel = Some(cancel.clone());
        self.engine_running = true;

        let engine = self.engine.clone();
        let speak = self.tts_commands.clone();
        let lock = self.llm_lock.clone();
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            let _guard = lock.lock().await;
            let outcome = engine.run_turn(request, &speak, &cancel).await;
            let _ = signal_tx.send(SessionSignal::EngineDone(outcome)).await;
        });
    }

    /// Seal the finished (or interrupted) assistant turn and decide what
    /// happens next: booking side effects or the queued run. Returns true
    /// when the session loop should stop.
    async fn on_engine_done(&mut self, outcome: TurnOutcome) -> bool {
        self.engine_running = false;
        self.engine_cancel = None;

        if let Some(at) = outcome.first_token_at {
            self.metrics.on_first_llm_token(at);
        }
        self.metrics.tool_calls += outcome.tool_calls.len() as u64;
        for record in outcome.tool_calls {
            self.history.push_tool(record);
        }
        self.history
            .push_assistant(outcome.assistant_text, outcome.interrupted);

        if !outcome.interrupted {
            self.metrics.responses += 1;
            // A completed run always ends with a Flush command.
            self.flushes_outstanding += 1;
            self.maybe_dispatch_booking().await;
        }

        if self.run_queued {
            self.run_queued = false;
            if !self.current_transcript.trim().is_empty() {
                return self.handle_debounced_utterance().await;
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // TTS events
    // -----------------------------------------------------------------------

    async fn on_tts_event(&mut self, event: TtsEvent) -> bool {
        match event {
            TtsEvent::Audio(audio) => {
                if self.tts_gate_open && self.state != TurnState::Ending {
                    self.metrics.on_audio_out(audio.len());
                    self.last_audio_activity = Instant::now();
                    if self.state == TurnState::Thinking {
                        self.state = TurnState::AISpeaking;
                    }
                    let _ = self.carrier_tx.send(CarrierCommand::Audio(audio)).await;
                }
                // Frames of an interrupted turn are discarded at the gate.
                false
            }
            TtsEvent::Flushed => {
                self.flushes_outstanding = self.flushes_outstanding.saturating_sub(1);
                if self.end_pending && !self.engine_running && self.flushes_outstanding == 0 {
                    self.seal_farewell();
                    self.begin_ending("farewell").await;
                    return true;
                }
                if matches!(self.state, TurnState::AISpeaking | TurnState::Thinking)
                    && !self.engine_running
                {
                    self.state = TurnState::Idle;
                }
                false
            }
            TtsEvent::Disconnected => {
                warn!(call_id = %self.call_id, "TTS disconnected, client is retrying");
                false
            }
            TtsEvent::Reconnected => {
                self.metrics.tts_reconnects += 1;
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Degraded paths and call end
    // -----------------------------------------------------------------------

    /// STT is gone for good: the caller must still hear speech before the
    /// hang-up, so speak the degraded line and end after the flush.
    async fn on_provider_unavailable(&mut self, which: &'static str) {
        error!(call_id = %self.call_id, provider = which, "Provider unavailable, degrading");
        if !self.tts_closed {
            self.tts_gate_open = true;
            let _ = self
                .tts_commands
                .send(TtsCommand::Speak(DEGRADED_LINE.to_string()))
                .await;
            let _ = self.tts_commands.send(TtsCommand::Flush).await;
            self.flushes_outstanding += 1;
            // Record the line only when it keeps the transcript alternating.
            if self.history.last_speaker() == Some(history::Role::User) {
                self.history.push_assistant(DEGRADED_LINE, false);
            }
            self.end_pending = true;
            self.schedule_end_deadline();
        } else {
            self.begin_ending("providers unavailable").await;
        }
    }

    fn schedule_end_deadline(&mut self) {
        if let Some(handle) = self.end_deadline_handle.take() {
            handle.abort();
        }
        let signal_tx = self.signal_tx.clone();
        let grace = self.config.end_grace;
        self.end_deadline_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = signal_tx.send(SessionSignal::EndDeadline).await;
        }));
    }

    fn cancel_pending_end(&mut self) {
        if !self.end_pending {
            return;
        }
        debug!(call_id = %self.call_id, "New speech cancelled pending call end");
        self.end_pending = false;
        // The farewell was un-said; drop it rather than letting it
        // recombine with the caller's next utterance.
        self.current_transcript.clear();
        if let Some(handle) = self.end_deadline_handle.take() {
            handle.abort();
        }
    }

    /// Enter the absorbing `Ending` state: no new engine work, child tasks
    /// cancelled, the carrier told to close.
    async fn begin_ending(&mut self, reason: &str) {
        if self.state == TurnState::Ending {
            return;
        }
        info!(call_id = %self.call_id, reason, "Ending call");
        self.state = TurnState::Ending;
        if let Some(cancel) = self.engine_cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.debounce_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.end_deadline_handle.take() {
            handle.abort();
        }
        let _ = self.tts_commands.try_send(TtsCommand::Close);
        let _ = self.carrier_tx.send(CarrierCommand::Close).await;
    }

    // -----------------------------------------------------------------------
    // Side effects
    // -----------------------------------------------------------------------

    /// Booking creation plus confirmation SMS, at most once per call.
    /// Failures are metrics, never call failures.
    async fn maybe_dispatch_booking(&mut self) {
        if self.booking_dispatched {
            return;
        }
        let Some(intent) = crate::sinks::detect_booking(
            &self.history,
            &self.tenant.tenant_id,
            self.start.caller_phone.as_deref(),
        ) else {
            return;
        };

        self.booking_dispatched = true;
        match self.booking_sink.create_booking(&intent).await {
            Ok(reference) => {
                info!(call_id = %self.call_id, reference = %reference, "Booking created");
                if let Some(phone) = intent.caller_phone.as_deref() {
                    let body = format!(
                        "Your booking with {} is confirmed. Reference {}.",
                        self.tenant.display_name, reference
                    );
                    if let Err(e) = self.sms_sink.send_confirmation(phone, &body).await {
                        warn!(call_id = %self.call_id, error = %e, "Confirmation SMS failed");
                        self.metrics.sink_failures += 1;
                    }
                }
                self.booking_reference = Some(reference);
            }
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Booking sink failed");
                self.metrics.sink_failures += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    async fn cleanup(mut self) -> SessionReport {
        self.state = TurnState::Ending;
        if let Some(cancel) = self.engine_cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.debounce_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.end_deadline_handle.take() {
            handle.abort();
        }

        let record = CallRecord {
            call_id: self.call_id.clone(),
            tenant_id: self.tenant.tenant_id.clone(),
            caller_phone: self.start.caller_phone.clone(),
            transcript: self.history.transcript(),
            outcome: if self.booking_reference.is_some() {
                "booked".to_string()
            } else {
                "completed".to_string()
            },
        };
        if let Err(e) = self.call_log.record_call(&record).await {
            warn!(call_id = %self.call_id, error = %e, "Call log write failed");
            self.metrics.sink_failures += 1;
        }

        self.metrics.log_summary();
        info!(call_id = %self.call_id, "Call session cleaned up");

        SessionReport {
            history: self.history,
            metrics: self.metrics,
            final_state: self.state,
            booking_reference: self.booking_reference,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
