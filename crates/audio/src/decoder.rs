// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Opus → PCM16 decoding with loss concealment.
//!
//! The libopus decoder is synchronous, so it lives on a dedicated blocking
//! task fed by a bounded command channel. Callers get a cheap handle whose
//! operations resolve once the codec task replies. Readiness (codec
//! construction) is reported through a separate one-shot so a pipeline can
//! queue frames that arrive before the codec is usable.

use bytes::Bytes;
use opus::Channels;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use streamscribe_core::ScribeError;

use crate::resample::is_supported_rate;

/// Longest decodable Opus frame: 120 ms.
const MAX_FRAME_MS: usize = 120;

/// Command channel depth; decode latency is sub-millisecond so a short
/// queue is enough to absorb bursts.
const COMMAND_CAPACITY: usize = 32;

/// Result of one decode or conceal call.
#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    /// Interleaved PCM16 samples.
    pub pcm: Vec<i16>,
    /// Samples per channel produced by this call.
    pub samples_decoded: usize,
    pub sample_rate: u32,
    pub channels: u16,
}

enum DecoderCommand {
    Decode { frame: Bytes, reply: oneshot::Sender<Result<DecodeOutcome, String>> },
    Conceal {
        next_frame: Option<Bytes>,
        samples: usize,
        reply: oneshot::Sender<Result<DecodeOutcome, String>>,
    },
    Reset { reply: oneshot::Sender<Result<(), String>> },
}

/// Handle to a decoder running on a blocking task.
///
/// Dropping the handle closes the command channel and frees the codec.
#[derive(Debug)]
pub struct OpusDecoder {
    cmd_tx: mpsc::Sender<DecoderCommand>,
    sample_rate: u32,
    channels: u16,
}

impl OpusDecoder {
    /// Spawns the codec task. The returned receiver resolves when codec
    /// construction finishes; a failure there is terminal for the decoder.
    ///
    /// # Errors
    ///
    /// Returns a codec error for sample rates outside the Opus set or
    /// channel counts other than 1 or 2.
    pub fn spawn(
        sample_rate: u32,
        channels: u16,
    ) -> Result<(Self, oneshot::Receiver<Result<(), ScribeError>>), ScribeError> {
        if !is_supported_rate(sample_rate) {
            return Err(ScribeError::Codec(format!(
                "opus decoder does not support {sample_rate} Hz"
            )));
        }
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(ScribeError::Codec(format!("opus decoder supports 1-2 channels, got {n}")))
            },
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            run_codec_task(sample_rate, channels, opus_channels, cmd_rx, ready_tx);
        });

        Ok((Self { cmd_tx, sample_rate, channels }, ready_rx))
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Decodes one Opus frame.
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed frames or a closed codec task.
    pub async fn decode(&self, frame: Bytes) -> Result<DecodeOutcome, ScribeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DecoderCommand::Decode { frame, reply })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?.map_err(ScribeError::Codec)
    }

    /// Synthesizes `samples` samples per channel to mask lost packets.
    ///
    /// When `next_frame` is supplied its in-band FEC data reconstructs the
    /// lost audio; otherwise plain packet-loss concealment runs.
    ///
    /// # Errors
    ///
    /// Returns a codec error when concealment fails or the task is gone.
    pub async fn conceal(
        &self,
        next_frame: Option<Bytes>,
        samples: usize,
    ) -> Result<DecodeOutcome, ScribeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DecoderCommand::Conceal { next_frame, samples, reply })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?.map_err(ScribeError::Codec)
    }

    /// Resets codec state (e.g. after a long gap).
    ///
    /// # Errors
    ///
    /// Returns a codec error when the reset CTL fails or the task is gone.
    pub async fn reset(&self) -> Result<(), ScribeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(DecoderCommand::Reset { reply }).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?.map_err(ScribeError::Codec)
    }
}

fn closed() -> ScribeError {
    ScribeError::Codec("opus decoder task is closed".to_string())
}

fn run_codec_task(
    sample_rate: u32,
    channels: u16,
    opus_channels: Channels,
    mut cmd_rx: mpsc::Receiver<DecoderCommand>,
    ready_tx: oneshot::Sender<Result<(), ScribeError>>,
) {
    let mut decoder = match opus::Decoder::new(sample_rate, opus_channels) {
        Ok(d) => {
            let _ = ready_tx.send(Ok(()));
            d
        },
        Err(e) => {
            let _ = ready_tx
                .send(Err(ScribeError::Codec(format!("failed to create opus decoder: {e}"))));
            return;
        },
    };

    // Reusable buffer sized for the longest legal frame.
    let max_samples = sample_rate as usize * MAX_FRAME_MS / 1000 * channels as usize;
    let mut pcm_buffer = vec![0i16; max_samples];

    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            DecoderCommand::Decode { frame, reply } => {
                let result = decoder
                    .decode(&frame, &mut pcm_buffer, false)
                    .map(|n| outcome(&pcm_buffer, n, sample_rate, channels))
                    .map_err(|e| e.to_string());
                if reply.send(result).is_err() {
                    break;
                }
            },
            DecoderCommand::Conceal { next_frame, samples, reply } => {
                let samples = samples.min(sample_rate as usize * MAX_FRAME_MS / 1000);
                let span = samples * channels as usize;
                let result = if span == 0 {
                    Ok(outcome(&pcm_buffer, 0, sample_rate, channels))
                } else {
                    let concealed = match next_frame {
                        Some(frame) => decoder.decode(&frame, &mut pcm_buffer[..span], true),
                        None => decoder.decode(&[], &mut pcm_buffer[..span], false),
                    };
                    concealed
                        .map(|n| outcome(&pcm_buffer, n, sample_rate, channels))
                        .map_err(|e| e.to_string())
                };
                if reply.send(result).is_err() {
                    break;
                }
            },
            DecoderCommand::Reset { reply } => {
                let result = decoder.reset_state().map_err(|e| e.to_string());
                if reply.send(result).is_err() {
                    break;
                }
            },
        }
    }

    debug!(sample_rate, channels, "opus decoder task finished");
}

fn outcome(buffer: &[i16], samples_per_channel: usize, sample_rate: u32, channels: u16) -> DecodeOutcome {
    let span = samples_per_channel * channels as usize;
    DecodeOutcome {
        pcm: buffer[..span].to_vec(),
        samples_decoded: samples_per_channel,
        sample_rate,
        channels,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn encode_frames(sample_rate: u32, frame_samples: usize, count: usize) -> Vec<Bytes> {
        let mut encoder =
            opus::Encoder::new(sample_rate, Channels::Mono, opus::Application::Voip).unwrap();
        let mut out = vec![0u8; 4000];
        (0..count)
            .map(|i| {
                #[allow(clippy::cast_possible_truncation)]
                let pcm: Vec<i16> = (0..frame_samples)
                    .map(|n| (((n + i * 31) % 200) as i16 - 100) * 50)
                    .collect();
                let len = encoder.encode(&pcm, &mut out).unwrap();
                Bytes::copy_from_slice(&out[..len])
            })
            .collect()
    }

    #[tokio::test]
    async fn decoder_becomes_ready_and_decodes() {
        let (decoder, ready) = OpusDecoder::spawn(24_000, 1).unwrap();
        ready.await.unwrap().unwrap();

        let frames = encode_frames(24_000, 480, 3);
        for frame in frames {
            let out = decoder.decode(frame).await.unwrap();
            assert_eq!(out.samples_decoded, 480);
            assert_eq!(out.pcm.len(), 480);
            assert_eq!(out.sample_rate, 24_000);
        }
    }

    #[tokio::test]
    async fn plc_produces_requested_sample_count() {
        let (decoder, ready) = OpusDecoder::spawn(24_000, 1).unwrap();
        ready.await.unwrap().unwrap();

        // Prime the codec with one real frame so PLC has state to work from.
        let frames = encode_frames(24_000, 480, 1);
        decoder.decode(frames[0].clone()).await.unwrap();

        let out = decoder.conceal(None, 480).await.unwrap();
        assert_eq!(out.samples_decoded, 480);
    }

    #[tokio::test]
    async fn fec_concealment_accepts_a_following_frame() {
        let (decoder, ready) = OpusDecoder::spawn(24_000, 1).unwrap();
        ready.await.unwrap().unwrap();

        let frames = encode_frames(24_000, 480, 3);
        decoder.decode(frames[0].clone()).await.unwrap();

        // Pretend frame 1 was lost; conceal using frame 2 as FEC source.
        let out = decoder.conceal(Some(frames[2].clone()), 480).await.unwrap();
        assert_eq!(out.samples_decoded, 480);

        let out = decoder.decode(frames[2].clone()).await.unwrap();
        assert_eq!(out.samples_decoded, 480);
    }

    #[tokio::test]
    async fn garbage_frames_error_without_killing_the_task() {
        let (decoder, ready) = OpusDecoder::spawn(24_000, 1).unwrap();
        ready.await.unwrap().unwrap();

        let err = decoder.decode(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])).await;
        assert!(err.is_err());

        // The task keeps serving after a per-frame failure.
        let frames = encode_frames(24_000, 480, 1);
        assert!(decoder.decode(frames[0].clone()).await.is_ok());
    }

    #[tokio::test]
    async fn reset_succeeds() {
        let (decoder, ready) = OpusDecoder::spawn(48_000, 2).unwrap();
        ready.await.unwrap().unwrap();
        decoder.reset().await.unwrap();
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        assert!(OpusDecoder::spawn(44_100, 1).is_err());
        assert!(OpusDecoder::spawn(24_000, 3).is_err());
    }
}
