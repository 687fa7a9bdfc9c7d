// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-participant pipeline: decoder, upstream backend, buffers and the
//! idle-commit timer.
//!
//! All methods run on the owning session's task, so the pipeline is
//! plain mutable state with no internal locking. Media arriving before
//! the decoder or backend is ready queues in FIFO order and drains on the
//! corresponding readiness event.

use std::collections::VecDeque;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use streamscribe_audio::{
    conceal_samples, pcm16_to_le_bytes, resample_linear, DecodeOutcome, OpusDecoder,
    SequenceAction, SequenceTracker, CONCEAL_SAMPLE_RATE,
};
use streamscribe_backends::{Backend, ConnStatus};
use streamscribe_core::{AudioEncoding, AudioFormat, MediaPayload, Participant, ScribeError};
use streamscribe_core::MAX_AUDIO_BLOCK;

use crate::metrics::ProxyMetrics;
use crate::session::SessionEvent;

/// Decoder lifecycle, tracked alongside the backend's connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStatus {
    Pending,
    Ready,
    Failed,
    Closed,
}

pub struct Pipeline {
    local_tag: String,
    participant: Participant,
    backend: Backend,
    conn_status: ConnStatus,
    decoder: Option<OpusDecoder>,
    decoder_status: DecoderStatus,
    desired_format: AudioFormat,
    sequence: SequenceTracker,
    /// Opus frames waiting for the decoder to become ready.
    opus_queue: VecDeque<Bytes>,
    /// Audio accumulated while the backend connects.
    pending_audio: BytesMut,
    /// Frozen oversized chunks, each sent as exactly one upstream append.
    pending_blocks: Vec<Bytes>,
    max_audio_block: usize,
    /// Samples per channel of the last successfully decoded frame.
    last_opus_frame_size: i64,
    /// Receive time of the first interim for the in-flight utterance.
    last_transcript_time: Option<u64>,
    idle_timer: Option<JoinHandle<()>>,
    force_commit_timeout: Duration,
    transcript_history: String,
    base_prompt: String,
    event_tx: mpsc::Sender<SessionEvent>,
    closed: bool,
}

impl Pipeline {
    pub fn new(
        tag: String,
        backend: Backend,
        input_format: AudioFormat,
        base_prompt: String,
        force_commit_timeout: Duration,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, ScribeError> {
        let participant = Participant::from_tag(&tag);
        let desired_format = backend.desired_audio_format(&input_format);

        let (decoder, decoder_status) = if desired_format.encoding == AudioEncoding::L16
            && input_format.is_opus()
        {
            let (decoder, ready_rx) = OpusDecoder::spawn(CONCEAL_SAMPLE_RATE, 1)?;
            let watcher_tag = tag.clone();
            let watcher_tx = event_tx.clone();
            tokio::spawn(async move {
                let event = match ready_rx.await {
                    Ok(Ok(())) => SessionEvent::DecoderReady { tag: watcher_tag },
                    Ok(Err(e)) => {
                        SessionEvent::DecoderFailed { tag: watcher_tag, message: e.to_string() }
                    },
                    Err(_) => SessionEvent::DecoderFailed {
                        tag: watcher_tag,
                        message: "decoder task dropped before init".to_string(),
                    },
                };
                let _ = watcher_tx.send(event).await;
            });
            (Some(decoder), DecoderStatus::Pending)
        } else {
            // Pass-through: the provider consumes the client's stream as-is.
            (None, DecoderStatus::Ready)
        };

        Ok(Self {
            local_tag: tag,
            participant,
            backend,
            conn_status: ConnStatus::Pending,
            decoder,
            decoder_status,
            desired_format,
            sequence: SequenceTracker::new(),
            opus_queue: VecDeque::new(),
            pending_audio: BytesMut::new(),
            pending_blocks: Vec::new(),
            max_audio_block: MAX_AUDIO_BLOCK,
            last_opus_frame_size: -1,
            last_transcript_time: None,
            idle_timer: None,
            force_commit_timeout,
            transcript_history: String::new(),
            base_prompt,
            event_tx,
            closed: false,
        })
    }

    pub const fn participant(&self) -> &Participant {
        &self.participant
    }

    pub const fn conn_status(&self) -> ConnStatus {
        self.conn_status
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn tag(&self) -> &str {
        &self.local_tag
    }

    /// Entry point for one downstream media event.
    pub async fn handle_media(&mut self, media: &MediaPayload, metrics: &ProxyMetrics) {
        if self.closed {
            return;
        }
        let Some(payload) = media.payload.as_deref() else {
            warn!(tag = %self.local_tag, "media event without payload, dropping");
            return;
        };
        if media.tag != self.local_tag {
            warn!(tag = %media.tag, expected = %self.local_tag, "media tag mismatch, dropping");
            return;
        }
        let frame = match BASE64.decode(payload) {
            Ok(decoded) => Bytes::from(decoded),
            Err(e) => {
                warn!(tag = %self.local_tag, error = %e, "invalid base64 payload, dropping");
                return;
            },
        };

        match self.sequence.observe(media.chunk, media.timestamp) {
            SequenceAction::Discard => {
                metrics.packets_discarded.add(1, &[]);
                debug!(tag = %self.local_tag, chunk = ?media.chunk, "discarding replayed frame");
            },
            SequenceAction::Gap { lost_frames, timestamp_delta } => {
                self.conceal_gap(lost_frames, timestamp_delta, &frame).await;
                self.decode_and_forward(frame, metrics).await;
            },
            SequenceAction::Deliver => {
                self.decode_and_forward(frame, metrics).await;
            },
        }
    }

    /// Masks a detected packet gap with synthetic PCM. The just-arrived
    /// frame supplies FEC data; concealment errors are logged, never
    /// propagated.
    async fn conceal_gap(&mut self, lost_frames: i64, timestamp_delta: i64, next_frame: &Bytes) {
        if self.decoder_status != DecoderStatus::Ready {
            return;
        }
        let samples = conceal_samples(lost_frames, timestamp_delta, self.last_opus_frame_size);
        if samples == 0 {
            return;
        }
        let result = match &self.decoder {
            Some(decoder) => decoder.conceal(Some(next_frame.clone()), samples).await,
            None => return,
        };
        match result {
            Ok(outcome) => {
                debug!(
                    tag = %self.local_tag,
                    lost_frames,
                    samples = outcome.samples_decoded,
                    "concealed packet loss"
                );
                let pcm = self.reformat(&outcome);
                self.forward(pcm).await;
            },
            Err(e) => {
                warn!(tag = %self.local_tag, error = %e, "concealment failed");
            },
        }
    }

    async fn decode_and_forward(&mut self, frame: Bytes, metrics: &ProxyMetrics) {
        if self.decoder.is_none() {
            // Pass-through provider: forward the compressed frame untouched.
            self.forward(frame).await;
            return;
        }
        match self.decoder_status {
            DecoderStatus::Ready => {
                let result = match &self.decoder {
                    Some(decoder) => decoder.decode(frame).await,
                    None => return,
                };
                match result {
                    Ok(outcome) => {
                        self.last_opus_frame_size = outcome.samples_decoded as i64;
                        let pcm = self.reformat(&outcome);
                        self.forward(pcm).await;
                    },
                    Err(e) => {
                        metrics.decode_failures.add(1, &[]);
                        warn!(tag = %self.local_tag, error = %e, "dropping undecodable frame");
                    },
                }
            },
            DecoderStatus::Pending => {
                self.opus_queue.push_back(frame);
            },
            DecoderStatus::Failed | DecoderStatus::Closed => {
                debug!(tag = %self.local_tag, "decoder unavailable, dropping frame");
            },
        }
    }

    /// Serializes decoded PCM for the backend, resampling when the
    /// desired rate differs from the decoder's.
    fn reformat(&self, outcome: &DecodeOutcome) -> Bytes {
        let desired_rate = self.desired_format.sample_rate.unwrap_or(outcome.sample_rate);
        if desired_rate == outcome.sample_rate {
            return Bytes::from(pcm16_to_le_bytes(&outcome.pcm));
        }
        match resample_linear(&outcome.pcm, outcome.sample_rate, desired_rate) {
            Ok(resampled) => Bytes::from(pcm16_to_le_bytes(&resampled)),
            Err(e) => {
                warn!(tag = %self.local_tag, error = %e, "resample failed, forwarding unconverted");
                Bytes::from(pcm16_to_le_bytes(&outcome.pcm))
            },
        }
    }

    /// Upstream forwarding: send when connected, buffer while pending,
    /// drop after failure.
    async fn forward(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        match self.conn_status {
            ConnStatus::Connected => {
                self.send_upstream(data).await;
            },
            ConnStatus::Pending => {
                if !self.pending_audio.is_empty()
                    && self.pending_audio.len() + data.len() > self.max_audio_block
                {
                    let frozen = self.pending_audio.split().freeze();
                    self.pending_blocks.push(frozen);
                }
                self.pending_audio.extend_from_slice(&data);
            },
            ConnStatus::Failed | ConnStatus::Closed => {
                debug!(tag = %self.local_tag, "backend unavailable, dropping audio");
            },
        }
    }

    async fn send_upstream(&mut self, data: Bytes) {
        match self.backend.send_audio(data).await {
            Ok(()) => self.restart_idle_timer(),
            Err(e) => warn!(tag = %self.local_tag, error = %e, "failed to forward audio"),
        }
    }

    /// Backend finished connecting: flush everything accumulated while
    /// pending, frozen blocks first, in arrival order.
    pub async fn on_backend_connected(&mut self) {
        self.conn_status = ConnStatus::Connected;
        let blocks: Vec<Bytes> = self.pending_blocks.drain(..).collect();
        for block in blocks {
            self.send_upstream(block).await;
        }
        if !self.pending_audio.is_empty() {
            let remainder = self.pending_audio.split().freeze();
            self.send_upstream(remainder).await;
        }
    }

    pub fn mark_backend_failed(&mut self) {
        self.conn_status = ConnStatus::Failed;
        self.clear_idle_timer();
    }

    pub fn mark_backend_closed(&mut self) {
        self.conn_status = ConnStatus::Closed;
        self.clear_idle_timer();
    }

    /// Decoder init finished: decode the queued frames in FIFO order.
    pub async fn on_decoder_ready(&mut self, metrics: &ProxyMetrics) {
        self.decoder_status = DecoderStatus::Ready;
        while let Some(frame) = self.opus_queue.pop_front() {
            self.decode_and_forward(frame, metrics).await;
        }
    }

    pub fn on_decoder_failed(&mut self) {
        self.decoder_status = DecoderStatus::Failed;
        self.opus_queue.clear();
    }

    /// Idle timer fired: ask the backend to finalize buffered audio.
    pub async fn on_idle_commit(&mut self) {
        self.idle_timer = None;
        if self.conn_status != ConnStatus::Connected {
            return;
        }
        debug!(tag = %self.local_tag, "idle timeout, forcing commit");
        if let Err(e) = self.backend.force_commit().await {
            warn!(tag = %self.local_tag, error = %e, "force commit failed");
        }
    }

    fn restart_idle_timer(&mut self) {
        self.clear_idle_timer();
        if self.force_commit_timeout.is_zero() {
            return;
        }
        let tag = self.local_tag.clone();
        let event_tx = self.event_tx.clone();
        let timeout = self.force_commit_timeout;
        self.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = event_tx.send(SessionEvent::IdleCommit { tag }).await;
        }));
    }

    pub fn clear_idle_timer(&mut self) {
        if let Some(handle) = self.idle_timer.take() {
            handle.abort();
        }
    }

    /// Timestamp for an interim result: receive time of the first delta
    /// of the in-flight utterance.
    pub fn note_interim(&mut self) -> u64 {
        let now = now_ms();
        *self.last_transcript_time.get_or_insert(now)
    }

    /// Timestamp for a completion: the first delta's receive time when
    /// one occurred, wall-clock otherwise. Clears the idle timer.
    pub fn note_complete(&mut self) -> u64 {
        self.clear_idle_timer();
        self.last_transcript_time.take().unwrap_or_else(now_ms)
    }

    /// Appends one peer transcript line and pushes the refreshed prompt
    /// upstream. The history is trimmed from the oldest side to
    /// `max_size` bytes, always restarting on a complete line.
    pub async fn add_transcript_context(&mut self, line: &str, max_size: usize) {
        self.transcript_history.push_str(line);
        if self.transcript_history.len() > max_size {
            let mut cut = self.transcript_history.len() - max_size;
            while cut < self.transcript_history.len()
                && !self.transcript_history.is_char_boundary(cut)
            {
                cut += 1;
            }
            if cut > 0 && self.transcript_history.as_bytes().get(cut - 1) != Some(&b'\n') {
                cut = match self.transcript_history[cut..].find('\n') {
                    Some(pos) => cut + pos + 1,
                    None => self.transcript_history.len(),
                };
            }
            self.transcript_history.drain(..cut);
        }

        let full_prompt = format!(
            "{}\n\nThe following is a transcription of what the participants have said so far:\n{}",
            self.base_prompt, self.transcript_history
        );
        if let Err(e) = self.backend.update_prompt(full_prompt).await {
            debug!(tag = %self.local_tag, error = %e, "prompt update not delivered");
        }
    }

    /// Tears the pipeline down. Idempotent; the backend emits its single
    /// `Closed` event on its own schedule.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.clear_idle_timer();
        self.conn_status = ConnStatus::Closed;
        self.decoder_status = DecoderStatus::Closed;
        self.opus_queue.clear();
        self.backend.close().await;
        // Dropping the handle frees the codec task.
        self.decoder = None;
    }

    #[cfg(test)]
    pub(crate) fn set_max_audio_block(&mut self, max: usize) {
        self.max_audio_block = max;
    }

    #[cfg(test)]
    pub(crate) const fn last_chunk(&self) -> i64 {
        self.sequence.last_chunk()
    }

    #[cfg(test)]
    pub(crate) fn transcript_history(&self) -> &str {
        &self.transcript_history
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
