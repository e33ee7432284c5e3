// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Deepgram streaming text-to-speech client.
//!
//! Maintains one WebSocket per call against `wss://api.deepgram.com/v1/speak`.
//! Text fragments go out as `{"type": "Speak", "text": ...}` messages; a
//! `{"type": "Flush"}` finalizes the buffered text and the server answers
//! with the remaining audio plus a `{"type": "Flushed"}` confirmation.
//! `{"type": "Clear"}` discards synthesis in progress, used on barge-in.
//!
//! The output format matches the carrier exactly (μ-law, 8 kHz, raw), so
//! binary frames are forwarded untouched.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::TtsError;
use crate::events::{TtsCommand, TtsEvent};

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SpeakOut<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct ControlOut<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
}

#[derive(Deserialize)]
struct TtsServerMessage {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    #[serde(default)]
    warn_msg: Option<String>,
    #[serde(default)]
    err_msg: Option<String>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Streaming TTS parameters.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Voice model, e.g. `aura-asteria-en`.
    pub model: String,
    pub sample_rate: u32,
    pub encoding: String,
    pub container: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Commands buffered while disconnected; overflow is dropped.
    pub disconnect_buffer_commands: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model: "aura-asteria-en".to_string(),
            sample_rate: 8000,
            encoding: "mulaw".to_string(),
            container: "none".to_string(),
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            disconnect_buffer_commands: 64,
        }
    }
}

/// The session-facing surface of a connected TTS stream.
pub struct TtsHandle {
    pub commands: mpsc::Sender<TtsCommand>,
    /// Audio frames and flush confirmations. The channel closing means the
    /// client gave up reconnecting.
    pub events: mpsc::Receiver<TtsEvent>,
}

// ---------------------------------------------------------------------------
// DeepgramTtsClient
// ---------------------------------------------------------------------------

/// Per-call Deepgram TTS connection.
pub struct DeepgramTtsClient {
    api_key: String,
    base_url: String,
    config: TtsConfig,
}

impl DeepgramTtsClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            config: TtsConfig::default(),
        }
    }

    /// Builder method: set the voice model.
    pub fn with_voice(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Builder method: replace the full parameter set.
    pub fn with_config(mut self, config: TtsConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the WebSocket URL with query parameters.
    fn build_ws_url(&self) -> String {
        let host = self.base_url.trim_end_matches('/');
        let c = &self.config;
        format!(
            "{}?model={}&encoding={}&sample_rate={}&container={}",
            host, c.model, c.encoding, c.sample_rate, c.container,
        )
    }

    async fn open(&self) -> Result<WsConn, TtsError> {
        let mut request = self
            .build_ws_url()
            .into_client_request()
            .map_err(|e| TtsError::Connect(format!("bad request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))
                .map_err(|e| TtsError::Connect(format!("bad api key header: {e}")))?,
        );

        let connected =
            tokio::time::timeout(Duration::from_secs(10), connect_async(request)).await;
        match connected {
            Ok(Ok((ws, _response))) => {
                debug!("DeepgramTtsClient: connected");
                Ok(ws)
            }
            Ok(Err(e)) => Err(TtsError::Connect(e.to_string())),
            Err(_) => Err(TtsError::Connect("connect timed out after 10s".to_string())),
        }
    }

    /// Connect and spawn the stream supervisor.
    pub async fn connect(self, cancel: CancellationToken) -> Result<TtsHandle, TtsError> {
        let ws = self.open().await?;

        let (command_tx, command_rx) = mpsc::channel::<TtsCommand>(256);
        let (events_tx, events_rx) = mpsc::channel::<TtsEvent>(256);

        tokio::spawn(async move {
            self.run(ws, command_rx, events_tx, cancel).await;
        });

        Ok(TtsHandle {
            commands: command_tx,
            events: events_rx,
        })
    }

    /// Encode one command as an outbound text frame. `Close` has no frame;
    /// the supervisor closes the socket instead.
    fn encode_command(command: &TtsCommand) -> Option<String> {
        match command {
            TtsCommand::Speak(text) => serde_json::to_string(&SpeakOut {
                msg_type: "Speak",
                text,
            })
            .ok(),
            TtsCommand::Flush => {
                serde_json::to_string(&ControlOut { msg_type: "Flush" }).ok()
            }
            TtsCommand::Clear => {
                serde_json::to_string(&ControlOut { msg_type: "Clear" }).ok()
            }
            TtsCommand::Close => None,
        }
    }

    async fn run(
        self,
        mut ws: WsConn,
        mut command_rx: mpsc::Receiver<TtsCommand>,
        events_tx: mpsc::Sender<TtsEvent>,
        cancel: CancellationToken,
    ) {
        let mut buffered: VecDeque<TtsCommand> = VecDeque::new();

        loop {
            let (mut sink, mut stream) = ws.split();

            while let Some(command) = buffered.pop_front() {
                if let Some(frame) = Self::encode_command(&command) {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = sink
                            .send(Message::Text(r#"{"type": "Close"}"#.to_string()))
                            .await;
                        let _ = sink.close().await;
                        debug!("DeepgramTtsClient: closed on cancellation");
                        return;
                    }
                    maybe_command = command_rx.recv() => match maybe_command {
                        Some(TtsCommand::Close) | None => {
                            let _ = sink
                                .send(Message::Text(r#"{"type": "Close"}"#.to_string()))
                                .await;
                            let _ = sink.close().await;
                            return;
                        }
                        Some(command) => {
                            if let Some(frame) = Self::encode_command(&command) {
                                if let Err(e) = sink.send(Message::Text(frame)).await {
                                    warn!(error = %e, "DeepgramTtsClient: send failed");
                                    buffered.push_back(command);
                                    break;
                                }
                            }
                        }
                    },
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Binary(audio))) => {
                            if !audio.is_empty()
                                && events_tx.send(TtsEvent::Audio(audio)).await.is_err()
                            {
                                return;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_text_message(&text, &events_tx);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "DeepgramTtsClient: server closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "DeepgramTtsClient: read error");
                            break;
                        }
                        None => {
                            debug!("DeepgramTtsClient: stream ended");
                            break;
                        }
                    },
                }
            }

            if events_tx.send(TtsEvent::Disconnected).await.is_err() {
                return;
            }

            match self
                .reconnect(&mut command_rx, &mut buffered, &cancel)
                .await
            {
                Some(new_ws) => {
                    ws = new_ws;
                    if events_tx.send(TtsEvent::Reconnected).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    async fn reconnect(
        &self,
        command_rx: &mut mpsc::Receiver<TtsCommand>,
        buffered: &mut VecDeque<TtsCommand>,
        cancel: &CancellationToken,
    ) -> Option<WsConn> {
        let mut delay = self.config.reconnect_base_delay;
        let mut dropped: u64 = 0;

        for attempt in 1..=self.config.max_reconnect_attempts {
            let deadline = tokio::time::Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    maybe_command = command_rx.recv() => match maybe_command {
                        Some(TtsCommand::Close) | None => return None,
                        Some(command) => {
                            if buffered.len() < self.config.disconnect_buffer_commands {
                                buffered.push_back(command);
                            } else {
                                dropped += 1;
                            }
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            match self.open().await {
                Ok(ws) => {
                    if dropped > 0 {
                        warn!(dropped, "DeepgramTtsClient: dropped commands while disconnected");
                    }
                    debug!(attempt, "DeepgramTtsClient: reconnected");
                    return Some(ws);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "DeepgramTtsClient: reconnect failed");
                    delay = (delay * 2).min(self.config.reconnect_max_delay);
                }
            }
        }

        error!(
            attempts = self.config.max_reconnect_attempts,
            "DeepgramTtsClient: reconnect attempts exhausted"
        );
        None
    }

    fn handle_text_message(text: &str, events_tx: &mpsc::Sender<TtsEvent>) {
        let msg: TtsServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "DeepgramTtsClient: unparseable message");
                return;
            }
        };

        match msg.msg_type.as_deref().unwrap_or("") {
            "Flushed" => {
                if let Err(e) = events_tx.try_send(TtsEvent::Flushed) {
                    warn!(error = %e, "DeepgramTtsClient: event channel full, dropping");
                }
            }
            "Warning" => {
                warn!(
                    warning = msg.warn_msg.as_deref().unwrap_or("unknown"),
                    "DeepgramTtsClient: provider warning"
                );
            }
            "Error" => {
                error!(
                    error = msg.err_msg.as_deref().unwrap_or("unknown"),
                    "DeepgramTtsClient: provider error"
                );
            }
            "Metadata" => {
                debug!("DeepgramTtsClient: metadata received");
            }
            other => {
                debug!(msg_type = other, "DeepgramTtsClient: unhandled message type");
            }
        }
    }
}

impl fmt::Debug for DeepgramTtsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepgramTtsClient")
            .field("base_url", &self.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
