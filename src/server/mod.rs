// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Carrier-facing WebSocket server.
//!
//! One axum route per concern: the per-call media stream upgrade and a
//! small status endpoint. The upgrade handler bridges the raw socket to the
//! session's channel surface, waits for the carrier's `start` event,
//! resolves the tenant, connects the per-call provider streams, and runs
//! the session under the registry's supervision.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::engine::ConversationEngine;
use crate::events::{CallStartInfo, CarrierCommand, CarrierEvent};
use crate::registry::SharedRegistry;
use crate::serializers::twilio::TwilioSerializer;
use crate::services::deepgram_stt::{DeepgramSttClient, SttConfig};
use crate::services::deepgram_tts::DeepgramTtsClient;
use crate::session::{CallSession, SessionConfig, SessionDeps};
use crate::sinks::{BookingSink, CallLogSink, SmsSink};
use crate::tenant::TenantResolver;

/// How long to wait for the carrier's `start` event after the upgrade.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the carrier-facing routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OrchestratorConfig>,
    pub registry: SharedRegistry,
    pub resolver: Arc<TenantResolver>,
    pub engine: Arc<ConversationEngine>,
    pub booking_sink: Arc<dyn BookingSink>,
    pub sms_sink: Arc<dyn SmsSink>,
    pub call_log: Arc<dyn CallLogSink>,
}

/// Build the carrier-facing router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/status", get(stream_status))
        .route("/stream/ws/:tenant_id/:call_id", get(media_stream))
        .with_state(state)
}

/// Status of the streaming infrastructure.
async fn stream_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.registry.active_count(),
        "mode": "streaming",
    }))
}

/// Per-call bidirectional media stream.
async fn media_stream(
    ws: WebSocketUpgrade,
    Path((tenant_id, call_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    info!(call_id, tenant_id, "Media stream upgrade requested");
    ws.on_upgrade(move |socket| handle_media_socket(socket, state, tenant_id, call_id))
}

/// Bridge the socket to channels, run the accept phase, then the session.
async fn handle_media_socket(
    socket: WebSocket,
    state: AppState,
    url_tenant_id: String,
    call_id: String,
) {
    if state.registry.is_shutting_down() {
        warn!(call_id, "Rejecting call during shutdown");
        return;
    }

    let (events_tx, mut carrier_rx) = mpsc::channel::<CarrierEvent>(256);
    let (carrier_tx, commands_rx) = mpsc::channel::<CarrierCommand>(256);
    tokio::spawn(transport_pump(socket, events_tx, commands_rx));

    // Accept phase: nothing meaningful can happen before `start`.
    let start_info = match wait_for_start(&mut carrier_rx).await {
        Some(info) => info,
        None => {
            warn!(call_id, "No start event, dropping connection");
            return;
        }
    };

    let tenant_key = start_info
        .tenant_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(&url_tenant_id);
    let tenant = state
        .resolver
        .resolve(Some(tenant_key), start_info.dialed_number.as_deref())
        .await;

    let cancel = state.registry.register(&call_id, &tenant.tenant_id);

    // Per-call provider streams. The TTS voice comes from the tenant.
    let api_key = state.config.deepgram_api_key.clone().unwrap_or_default();
    let stt = DeepgramSttClient::new(api_key.clone(), state.config.stt_url.clone())
        .with_config(SttConfig {
            language: tenant.language.clone(),
            utterance_end_ms: state.config.stt_utterance_end_ms,
            endpointing_ms: state.config.stt_endpointing_ms,
            ..SttConfig::default()
        })
        .connect(cancel.child_token())
        .await;
    let stt = match stt {
        Ok(handle) => handle,
        Err(e) => {
            error!(call_id, error = %e, "STT connect failed, dropping call");
            state.registry.unregister(&call_id);
            let _ = carrier_tx.send(CarrierCommand::Close).await;
            return;
        }
    };

    let tts = DeepgramTtsClient::new(api_key, state.config.tts_url.clone())
        .with_voice(tenant.voice.voice.clone())
        .connect(cancel.child_token())
        .await;
    let tts = match tts {
        Ok(handle) => handle,
        Err(e) => {
            error!(call_id, error = %e, "TTS connect failed, dropping call");
            state.registry.unregister(&call_id);
            let _ = carrier_tx.send(CarrierCommand::Close).await;
            return;
        }
    };

    let session_config = SessionConfig {
        debounce_window: state.config.utterance_debounce,
        idle_timeout: state.config.session_idle_timeout,
        ..SessionConfig::default()
    };
    let deps = SessionDeps {
        carrier_rx,
        carrier_tx,
        stt_audio_tx: stt.audio_tx,
        stt_events: stt.events,
        tts_commands: tts.commands,
        tts_events: tts.events,
        engine: state.engine.clone(),
        booking_sink: state.booking_sink.clone(),
        sms_sink: state.sms_sink.clone(),
        call_log: state.call_log.clone(),
    };
    let session = CallSession::new(
        call_id.clone(),
        start_info,
        tenant,
        session_config,
        deps,
        cancel,
    );

    state.registry.supervise(&call_id, session.run()).await;
}

/// Consume carrier events until the `start` event arrives.
async fn wait_for_start(
    carrier_rx: &mut mpsc::Receiver<CarrierEvent>,
) -> Option<CallStartInfo> {
    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, carrier_rx.recv()).await {
            Ok(Some(CarrierEvent::Start(info))) => return Some(info),
            Ok(Some(CarrierEvent::Connected)) => continue,
            Ok(Some(CarrierEvent::Stop | CarrierEvent::ConnectionLost)) | Ok(None) => {
                return None
            }
            Ok(Some(_)) => continue,
            Err(_) => return None,
        }
    }
}

/// Single task owning both socket halves: decodes inbound frames into
/// [`CarrierEvent`]s and encodes [`CarrierCommand`]s outbound. Captures the
/// stream SID from the `start` event for outbound framing.
async fn transport_pump(
    socket: WebSocket,
    events_tx: mpsc::Sender<CarrierEvent>,
    mut commands_rx: mpsc::Receiver<CarrierCommand>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut stream_sid = String::new();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = TwilioSerializer::decode_event(&text) {
                        if let CarrierEvent::Start(ref info) = event {
                            stream_sid = info.stream_sid.clone();
                        }
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events_tx.send(CarrierEvent::ConnectionLost).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Carrier socket error");
                    let _ = events_tx.send(CarrierEvent::ConnectionLost).await;
                    break;
                }
            },
            command = commands_rx.recv() => match command {
                Some(CarrierCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(command) => {
                    if let Some(frame) = TwilioSerializer::encode_command(&command, &stream_sid) {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            let _ = events_tx.send(CarrierEvent::ConnectionLost).await;
                            break;
                        }
                    }
                }
            },
        }
    }
    debug!("Transport pump ended");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
