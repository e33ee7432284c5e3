// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Twilio Media Streams wire protocol.
//!
//! Handles the JSON framing of the carrier's bidirectional audio WebSocket.
//! Incoming events:
//!
//! - `connected` - connection established
//! - `start` - stream metadata (`streamSid`, `customParameters`)
//! - `media` - audio payload, base64-encoded μ-law at 8 kHz mono
//! - `mark` - playback position marker acknowledgment
//! - `stop` - stream ended
//!
//! Outgoing events:
//!
//! - `media` - base64 μ-law audio for playback
//! - `mark` - playback tracking marker
//! - `clear` - drop queued outbound audio (barge-in)
//!
//! Audio passes through untouched: the carrier, the STT provider, and the
//! TTS provider all speak μ-law 8 kHz mono, so no transcoding happens
//! anywhere in this crate.

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::{CallStartInfo, CarrierCommand, CarrierEvent};

/// Base64-encode μ-law audio for an outbound `media` frame.
fn encode_payload(audio: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(audio)
}

/// Decode the base64 audio payload of an inbound `media` frame. `None` for
/// payloads that are not valid base64.
fn decode_payload(payload: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(payload).ok()
}

// ---------------------------------------------------------------------------
// Wire-format types
// ---------------------------------------------------------------------------

/// Top-level incoming Twilio WebSocket message.
#[derive(Deserialize, Debug)]
struct TwilioMessage {
    event: String,
    #[serde(default)]
    start: Option<TwilioStartPayload>,
    #[serde(default)]
    media: Option<TwilioMediaPayload>,
    #[serde(default)]
    mark: Option<TwilioMarkPayload>,
    #[serde(rename = "streamSid", default)]
    #[allow(dead_code)]
    stream_sid: Option<String>,
}

/// Payload for the `start` event.
#[derive(Deserialize, Debug)]
struct TwilioStartPayload {
    #[serde(rename = "streamSid")]
    stream_sid: String,
    #[serde(rename = "customParameters", default)]
    custom_parameters: Option<TwilioCustomParameters>,
    #[serde(rename = "mediaFormat", default)]
    #[allow(dead_code)]
    media_format: Option<serde_json::Value>,
}

/// Custom parameters attached to the stream by the inbound-call webhook.
#[derive(Deserialize, Debug, Default)]
struct TwilioCustomParameters {
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    caller_phone: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    dialed_number: Option<String>,
}

/// Payload for the `media` event.
#[derive(Deserialize, Debug)]
struct TwilioMediaPayload {
    payload: String,
    #[serde(default)]
    #[allow(dead_code)]
    track: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<String>,
}

/// Payload for the `mark` event.
#[derive(Deserialize, Debug)]
struct TwilioMarkPayload {
    name: String,
}

/// Outgoing media message.
#[derive(Serialize)]
struct TwilioMediaOut<'a> {
    event: &'a str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
    media: TwilioMediaPayloadOut,
}

#[derive(Serialize)]
struct TwilioMediaPayloadOut {
    payload: String,
}

/// Outgoing mark message.
#[derive(Serialize)]
struct TwilioMarkOut<'a> {
    event: &'a str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
    mark: TwilioMarkPayloadOut<'a>,
}

#[derive(Serialize)]
struct TwilioMarkPayloadOut<'a> {
    name: &'a str,
}

/// Outgoing clear message.
#[derive(Serialize)]
struct TwilioClearOut<'a> {
    event: &'a str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
}

// ---------------------------------------------------------------------------
// TwilioSerializer
// ---------------------------------------------------------------------------

/// Stateless codec between carrier wire frames and session-level
/// [`CarrierEvent`] / [`CarrierCommand`] values.
///
/// The stream SID is captured from the `start` event by the transport pump
/// and passed to [`TwilioSerializer::encode_command`] on every outbound
/// frame.
#[derive(Debug, Default)]
pub struct TwilioSerializer;

impl TwilioSerializer {
    /// Decode one incoming text frame into a [`CarrierEvent`].
    ///
    /// Returns `None` for malformed JSON and for event types the session
    /// has no use for; both are logged and dropped.
    pub fn decode_event(text: &str) -> Option<CarrierEvent> {
        let msg: TwilioMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Twilio: invalid JSON frame");
                return None;
            }
        };

        match msg.event.as_str() {
            "connected" => {
                debug!("Twilio: connected");
                Some(CarrierEvent::Connected)
            }
            "start" => {
                let start = match msg.start {
                    Some(s) => s,
                    None => {
                        warn!("Twilio: start event missing start payload");
                        return None;
                    }
                };
                debug!(stream_sid = %start.stream_sid, "Twilio: stream started");
                let params = start.custom_parameters.unwrap_or_default();
                Some(CarrierEvent::Start(CallStartInfo {
                    stream_sid: start.stream_sid,
                    tenant_id: params.tenant_id,
                    caller_phone: params.caller_phone,
                    call_id: params.call_id,
                    dialed_number: params.dialed_number,
                }))
            }
            "media" => {
                let media = msg.media?;
                match decode_payload(&media.payload) {
                    Some(audio) => Some(CarrierEvent::Media(audio)),
                    None => {
                        warn!("Twilio: failed to decode base64 audio payload");
                        None
                    }
                }
            }
            "mark" => {
                let mark = match msg.mark {
                    Some(m) => m,
                    None => {
                        warn!("Twilio: mark event missing mark payload");
                        return None;
                    }
                };
                debug!(name = %mark.name, "Twilio: mark reached");
                Some(CarrierEvent::Mark(mark.name))
            }
            "stop" => {
                debug!("Twilio: stream stopped");
                Some(CarrierEvent::Stop)
            }
            other => {
                debug!(event = other, "Twilio: ignoring event type");
                None
            }
        }
    }

    /// Encode one outbound [`CarrierCommand`] as a text frame.
    ///
    /// [`CarrierCommand::Close`] produces no frame; the transport pump
    /// closes the socket instead.
    pub fn encode_command(command: &CarrierCommand, stream_sid: &str) -> Option<String> {
        match command {
            CarrierCommand::Audio(audio) => {
                let msg = TwilioMediaOut {
                    event: "media",
                    stream_sid,
                    media: TwilioMediaPayloadOut {
                        payload: encode_payload(audio),
                    },
                };
                serde_json::to_string(&msg).ok()
            }
            CarrierCommand::Mark(name) => {
                let msg = TwilioMarkOut {
                    event: "mark",
                    stream_sid,
                    mark: TwilioMarkPayloadOut { name },
                };
                serde_json::to_string(&msg).ok()
            }
            CarrierCommand::Clear => {
                debug!("Twilio: sending clear");
                let msg = TwilioClearOut {
                    event: "clear",
                    stream_sid,
                };
                serde_json::to_string(&msg).ok()
            }
            CarrierCommand::Close => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
