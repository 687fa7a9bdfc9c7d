// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared types for the StreamScribe transcription proxy: domain model,
//! client wire messages, errors and constants.

pub mod constants;
pub mod error;
pub mod messages;
pub mod types;

pub use constants::{MAX_AUDIO_BLOCK, MAX_TAG_LEN};
pub use error::{Result, ScribeError};
pub use messages::{
    ClientEvent, MediaPayload, ServerEvent, TranscriptAlternative, TranscriptionResult,
};
pub use types::{AudioEncoding, AudioFormat, Participant, ProviderKind};
