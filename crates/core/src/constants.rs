// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

/// Largest pending-audio buffer forwarded upstream in one append.
///
/// 15 MiB provider message cap scaled by 3/4 so the payload still fits
/// after base64 expansion.
pub const MAX_AUDIO_BLOCK: usize = 15 * 1024 * 1024 * 3 / 4;

/// Maximum accepted length of a participant tag on `/transcribe`.
pub const MAX_TAG_LEN: usize = 128;
