// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Per-call latency and quality metrics.

use tokio::time::Instant;
use tracing::info;

/// Latency stamps and counters for one call. Owned and written solely by
/// the session's event loop.
#[derive(Debug)]
pub struct CallMetrics {
    pub call_id: String,
    pub started_at: Instant,
    pub first_audio_in_at: Option<Instant>,
    pub first_transcript_at: Option<Instant>,
    pub first_llm_token_at: Option<Instant>,
    pub first_tts_audio_at: Option<Instant>,
    pub utterances: u64,
    pub responses: u64,
    pub tool_calls: u64,
    pub barge_ins: u64,
    pub stt_reconnects: u64,
    pub tts_reconnects: u64,
    pub audio_bytes_in: u64,
    pub audio_bytes_out: u64,
    /// Inbound frames dropped because the STT queue was full.
    pub dropped_frames: u64,
    /// Booking/SMS/call-log writes that failed (non-fatal).
    pub sink_failures: u64,
}

impl CallMetrics {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            started_at: Instant::now(),
            first_audio_in_at: None,
            first_transcript_at: None,
            first_llm_token_at: None,
            first_tts_audio_at: None,
            utterances: 0,
            responses: 0,
            tool_calls: 0,
            barge_ins: 0,
            stt_reconnects: 0,
            tts_reconnects: 0,
            audio_bytes_in: 0,
            audio_bytes_out: 0,
            dropped_frames: 0,
            sink_failures: 0,
        }
    }

    /// Record an inbound audio frame. The first one stamps the timeline.
    pub fn on_audio_in(&mut self, bytes: usize) {
        if self.first_audio_in_at.is_none() {
            self.first_audio_in_at = Some(Instant::now());
        }
        self.audio_bytes_in += bytes as u64;
    }

    /// Record an outbound audio frame.
    pub fn on_audio_out(&mut self, bytes: usize) {
        if self.first_tts_audio_at.is_none() {
            self.first_tts_audio_at = Some(Instant::now());
        }
        self.audio_bytes_out += bytes as u64;
    }

    pub fn on_first_transcript(&mut self) {
        if self.first_transcript_at.is_none() {
            self.first_transcript_at = Some(Instant::now());
        }
    }

    pub fn on_first_llm_token(&mut self, at: Instant) {
        if self.first_llm_token_at.is_none() {
            self.first_llm_token_at = Some(at);
        }
    }

    /// Milliseconds from first inbound audio to first transcript.
    pub fn time_to_first_transcript_ms(&self) -> Option<u64> {
        Some(
            self.first_transcript_at?
                .duration_since(self.first_audio_in_at?)
                .as_millis() as u64,
        )
    }

    /// Milliseconds from first transcript to first response audio.
    pub fn time_to_first_response_ms(&self) -> Option<u64> {
        Some(
            self.first_tts_audio_at?
                .duration_since(self.first_transcript_at?)
                .as_millis() as u64,
        )
    }

    /// Log the end-of-call summary.
    pub fn log_summary(&self) {
        info!(
            call_id = %self.call_id,
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            ttft_ms = self.time_to_first_transcript_ms(),
            ttfr_ms = self.time_to_first_response_ms(),
            utterances = self.utterances,
            responses = self.responses,
            tool_calls = self.tool_calls,
            barge_ins = self.barge_ins,
            stt_reconnects = self.stt_reconnects,
            tts_reconnects = self.tts_reconnects,
            audio_kb_in = self.audio_bytes_in / 1024,
            audio_kb_out = self.audio_bytes_out / 1024,
            dropped_frames = self.dropped_frames,
            sink_failures = self.sink_failures,
            "Call metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn latency_stamps_are_first_wins() {
        let mut metrics = CallMetrics::new("CA1");
        metrics.on_audio_in(160);
        tokio::time::advance(std::time::Duration::from_millis(300)).await;
        metrics.on_first_transcript();
        metrics.on_first_transcript();
        tokio::time::advance(std::time::Duration::from_millis(500)).await;
        metrics.on_audio_out(320);
        metrics.on_audio_out(320);

        assert_eq!(metrics.time_to_first_transcript_ms(), Some(300));
        assert_eq!(metrics.time_to_first_response_ms(), Some(500));
        assert_eq!(metrics.audio_bytes_in, 160);
        assert_eq!(metrics.audio_bytes_out, 640);
    }

    #[test]
    fn incomplete_timelines_yield_none() {
        let metrics = CallMetrics::new("CA1");
        assert_eq!(metrics.time_to_first_transcript_ms(), None);
        assert_eq!(metrics.time_to_first_response_ms(), None);
    }
}
