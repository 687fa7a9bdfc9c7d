// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Audio processing for the transcription proxy: Opus decoding with
//! packet-loss concealment, per-tag sequence tracking and PCM16
//! sample-rate conversion.

pub mod decoder;
pub mod resample;
pub mod sequence;

pub use decoder::{DecodeOutcome, OpusDecoder};
pub use resample::{pcm16_from_le_bytes, pcm16_to_le_bytes, resample_linear, SUPPORTED_RATES};
pub use sequence::{
    conceal_samples, SequenceAction, SequenceTracker, CONCEAL_SAMPLE_RATE, MAX_CONCEAL_SAMPLES,
};
