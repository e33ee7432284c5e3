// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Deepgram streaming speech-to-text client.
//!
//! Maintains one WebSocket per call against `wss://api.deepgram.com/v1/listen`.
//! Audio frames flow out as binary messages; transcription results and
//! voice-activity events come back as JSON text frames and are surfaced to
//! the session as [`SttEvent`]s.
//!
//! The endpointing threshold defaults to 2500 ms: the shorter 1000 ms
//! setting truncates natural thinking pauses mid-sentence, and 2500 ms is
//! the minimum that preserves them while keeping total response latency
//! acceptable once the session's debounce is applied. Utterance-end delay
//! stays at 2000 ms.
//!
//! On provider-side close or error the client reconnects with exponential
//! backoff (250 ms doubling to a 10 s cap) up to a configured attempt
//! count. While disconnected, inbound audio buffers up to a bounded frame
//! count; overflow is dropped and counted.

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::SttError;
use crate::events::SttEvent;

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Deepgram keeps idle connections alive for ~10 s; ping it well inside
/// that window.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Minimal first-pass envelope; the hot-path "Results" type gets a second
/// parse into [`DgResult`].
#[derive(Deserialize)]
struct DgTypeOnly {
    #[serde(rename = "type")]
    msg_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DgAlternative {
    transcript: String,
    #[serde(default)]
    #[allow(dead_code)]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct DgChannel {
    alternatives: Vec<DgAlternative>,
}

#[derive(Debug, Deserialize)]
struct DgResult {
    channel: Option<DgChannel>,
    is_final: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DgError {
    description: Option<String>,
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Streaming STT parameters.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub model: String,
    pub language: String,
    pub sample_rate: u32,
    pub encoding: String,
    pub channels: u32,
    pub punctuate: bool,
    pub interim_results: bool,
    pub utterance_end_ms: u32,
    pub vad_events: bool,
    pub endpointing_ms: u32,
    /// Reconnect backoff floor.
    pub reconnect_base_delay: Duration,
    /// Reconnect backoff ceiling.
    pub reconnect_max_delay: Duration,
    /// Give up after this many consecutive failed reconnect attempts.
    pub max_reconnect_attempts: u32,
    /// Frames buffered while disconnected; overflow is dropped.
    pub disconnect_buffer_frames: usize,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            language: "en-AU".to_string(),
            sample_rate: 8000,
            encoding: "mulaw".to_string(),
            channels: 1,
            punctuate: true,
            interim_results: true,
            utterance_end_ms: 2000,
            vad_events: true,
            endpointing_ms: 2500,
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            disconnect_buffer_frames: 256,
        }
    }
}

/// The session-facing surface of a connected STT stream.
pub struct SttHandle {
    /// μ-law frames to transcribe. `try_send` from the hot path; a full
    /// queue drops the frame rather than stalling the carrier pump.
    pub audio_tx: mpsc::Sender<Vec<u8>>,
    /// Transcripts and VAD events. The channel closing means the client
    /// gave up reconnecting.
    pub events: mpsc::Receiver<SttEvent>,
}

// ---------------------------------------------------------------------------
// DeepgramSttClient
// ---------------------------------------------------------------------------

/// Per-call Deepgram STT connection.
pub struct DeepgramSttClient {
    api_key: String,
    base_url: String,
    config: SttConfig,
}

impl DeepgramSttClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            config: SttConfig::default(),
        }
    }

    /// Builder method: replace the full parameter set.
    pub fn with_config(mut self, config: SttConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder method: set the language code.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.config.language = language.into();
        self
    }

    /// Build the WebSocket URL with query parameters.
    fn build_ws_url(&self) -> String {
        let host = self.base_url.trim_end_matches('/');
        let c = &self.config;
        let mut url = format!(
            "{}?model={}&language={}&encoding={}&sample_rate={}&channels={}",
            host, c.model, c.language, c.encoding, c.sample_rate, c.channels,
        );
        if c.punctuate {
            url.push_str("&punctuate=true");
        }
        if c.interim_results {
            url.push_str("&interim_results=true");
        }
        let _ = write!(url, "&utterance_end_ms={}", c.utterance_end_ms);
        if c.vad_events {
            url.push_str("&vad_events=true");
        }
        let _ = write!(url, "&endpointing={}", c.endpointing_ms);
        url
    }

    async fn open(&self) -> Result<WsConn, SttError> {
        let mut request = self
            .build_ws_url()
            .into_client_request()
            .map_err(|e| SttError::Connect(format!("bad request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))
                .map_err(|e| SttError::Connect(format!("bad api key header: {e}")))?,
        );

        let connected =
            tokio::time::timeout(Duration::from_secs(10), connect_async(request)).await;
        match connected {
            Ok(Ok((ws, _response))) => {
                debug!("DeepgramSttClient: connected");
                Ok(ws)
            }
            Ok(Err(e)) => Err(SttError::Connect(e.to_string())),
            Err(_) => Err(SttError::Connect("connect timed out after 10s".to_string())),
        }
    }

    /// Connect and spawn the stream supervisor.
    ///
    /// Fails fast when the first connection cannot be established; after
    /// that, drops are handled by the reconnect policy inside the spawned
    /// task.
    pub async fn connect(self, cancel: CancellationToken) -> Result<SttHandle, SttError> {
        let ws = self.open().await?;

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(512);
        let (events_tx, events_rx) = mpsc::channel::<SttEvent>(256);

        tokio::spawn(async move {
            self.run(ws, audio_rx, events_tx, cancel).await;
        });

        Ok(SttHandle {
            audio_tx,
            events: events_rx,
        })
    }

    /// Stream supervisor: pumps audio out and events in, reconnecting on
    /// drops until cancelled, the session goes away, or retries exhaust.
    async fn run(
        self,
        mut ws: WsConn,
        mut audio_rx: mpsc::Receiver<Vec<u8>>,
        events_tx: mpsc::Sender<SttEvent>,
        cancel: CancellationToken,
    ) {
        let mut buffered: VecDeque<Vec<u8>> = VecDeque::new();

        loop {
            let (mut sink, mut stream) = ws.split();

            // Flush audio that arrived while we were reconnecting.
            while let Some(frame) = buffered.pop_front() {
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }

            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            keepalive.reset();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = sink
                            .send(Message::Text(r#"{"type": "CloseStream"}"#.to_string()))
                            .await;
                        let _ = sink.close().await;
                        debug!("DeepgramSttClient: closed on cancellation");
                        return;
                    }
                    maybe_frame = audio_rx.recv() => match maybe_frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(Message::Binary(frame)).await {
                                warn!(error = %e, "DeepgramSttClient: audio send failed");
                                break;
                            }
                        }
                        None => {
                            // Session dropped the handle.
                            let _ = sink
                                .send(Message::Text(r#"{"type": "CloseStream"}"#.to_string()))
                                .await;
                            let _ = sink.close().await;
                            return;
                        }
                    },
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_text_message(&text, &events_tx);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "DeepgramSttClient: server closed");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Pings are answered by tungstenite; binary from
                            // the provider is unexpected but harmless.
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "DeepgramSttClient: read error");
                            break;
                        }
                        None => {
                            debug!("DeepgramSttClient: stream ended");
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        let _ = sink
                            .send(Message::Text(r#"{"type": "KeepAlive"}"#.to_string()))
                            .await;
                    }
                }
            }

            if events_tx.send(SttEvent::Disconnected).await.is_err() {
                return;
            }

            match self
                .reconnect(&mut audio_rx, &mut buffered, &cancel)
                .await
            {
                Some(new_ws) => {
                    ws = new_ws;
                    if events_tx.send(SttEvent::Reconnected).await.is_err() {
                        return;
                    }
                }
                // Cancelled, session gone, or retries exhausted. Dropping
                // events_tx closes the channel, which the session reads as
                // ProviderUnavailable.
                None => return,
            }
        }
    }

    /// Exponential-backoff reconnect. Buffers audio while waiting; drops
    /// and counts overflow.
    async fn reconnect(
        &self,
        audio_rx: &mut mpsc::Receiver<Vec<u8>>,
        buffered: &mut VecDeque<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Option<WsConn> {
        let mut delay = self.config.reconnect_base_delay;
        let mut dropped: u64 = 0;

        for attempt in 1..=self.config.max_reconnect_attempts {
            let deadline = tokio::time::Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    maybe_frame = audio_rx.recv() => match maybe_frame {
                        Some(frame) => {
                            if buffered.len() < self.config.disconnect_buffer_frames {
                                buffered.push_back(frame);
                            } else {
                                dropped += 1;
                            }
                        }
                        None => return None,
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            match self.open().await {
                Ok(ws) => {
                    if dropped > 0 {
                        warn!(dropped, "DeepgramSttClient: dropped frames while disconnected");
                    }
                    debug!(attempt, "DeepgramSttClient: reconnected");
                    return Some(ws);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "DeepgramSttClient: reconnect failed");
                    delay = (delay * 2).min(self.config.reconnect_max_delay);
                }
            }
        }

        error!(
            attempts = self.config.max_reconnect_attempts,
            "DeepgramSttClient: reconnect attempts exhausted"
        );
        None
    }

    /// Parse one provider text frame and forward the matching event.
    fn handle_text_message(text: &str, events_tx: &mpsc::Sender<SttEvent>) {
        let envelope: DgTypeOnly = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "DeepgramSttClient: unparseable message");
                return;
            }
        };

        let event = match envelope.msg_type.as_deref().unwrap_or("") {
            "Results" => match serde_json::from_str::<DgResult>(text) {
                Ok(result) => {
                    let transcript = result
                        .channel
                        .as_ref()
                        .and_then(|ch| ch.alternatives.first())
                        .map(|alt| alt.transcript.as_str())
                        .unwrap_or("");
                    if transcript.is_empty() {
                        return;
                    }
                    Some(SttEvent::Transcript {
                        text: transcript.to_string(),
                        is_final: result.is_final.unwrap_or(false),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "DeepgramSttClient: bad Results message");
                    None
                }
            },
            "UtteranceEnd" => Some(SttEvent::UtteranceEnd),
            "SpeechStarted" => Some(SttEvent::SpeechStarted),
            "Metadata" => {
                debug!("DeepgramSttClient: metadata received");
                None
            }
            "Error" => {
                let description = serde_json::from_str::<DgError>(text)
                    .ok()
                    .and_then(|e| e.description.or(e.message))
                    .unwrap_or_else(|| "unknown".to_string());
                error!(description, "DeepgramSttClient: provider error");
                None
            }
            other => {
                debug!(msg_type = other, "DeepgramSttClient: unhandled message type");
                None
            }
        };

        if let Some(event) = event {
            if let Err(e) = events_tx.try_send(event) {
                warn!(error = %e, "DeepgramSttClient: event channel full, dropping");
            }
        }
    }
}

impl fmt::Debug for DeepgramSttClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepgramSttClient")
            .field("base_url", &self.base_url)
            .field("model", &self.config.model)
            .field("endpointing_ms", &self.config.endpointing_ms)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
