// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core domain types: audio formats, participants, providers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ScribeError;

/// Audio payload encoding on either side of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AudioEncoding {
    /// Raw Opus frames (one packet per media event).
    #[serde(rename = "opus")]
    #[default]
    Opus,
    /// Opus wrapped in an Ogg container stream.
    #[serde(rename = "ogg-opus")]
    OggOpus,
    /// Little-endian signed 16-bit PCM.
    #[serde(rename = "L16")]
    L16,
}

impl FromStr for AudioEncoding {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opus" => Ok(Self::Opus),
            "ogg-opus" => Ok(Self::OggOpus),
            "L16" | "l16" | "linear16" => Ok(Self::L16),
            other => Err(ScribeError::Policy(format!("unsupported audio encoding '{other}'"))),
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opus => "opus",
            Self::OggOpus => "ogg-opus",
            Self::L16 => "L16",
        };
        f.write_str(s)
    }
}

/// Describes an audio stream at some point in the pipeline.
///
/// `sample_rate` is mandatory for [`AudioEncoding::L16`] once audio has
/// passed the decoder; for compressed encodings the rate is carried in the
/// bitstream and may be absent here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
}

impl AudioFormat {
    /// PCM16 mono at the given rate.
    pub const fn pcm(sample_rate: u32) -> Self {
        Self { encoding: AudioEncoding::L16, sample_rate: Some(sample_rate), channels: Some(1) }
    }

    pub const fn opus() -> Self {
        Self { encoding: AudioEncoding::Opus, sample_rate: None, channels: None }
    }

    pub const fn ogg_opus() -> Self {
        Self { encoding: AudioEncoding::OggOpus, sample_rate: None, channels: None }
    }

    /// Whether the payload is compressed (Opus in any framing).
    pub const fn is_opus(&self) -> bool {
        matches!(self.encoding, AudioEncoding::Opus | AudioEncoding::OggOpus)
    }
}

/// Identity of one conference participant, derived from the media `tag`.
///
/// Tags of the form `<hex endpoint id>-<decimal ssrc>` split into both
/// fields; anything else is treated as an opaque id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<String>,
}

impl Participant {
    pub fn from_tag(tag: &str) -> Self {
        if let Some((endpoint, ssrc)) = tag.split_once('-') {
            let endpoint_is_hex =
                !endpoint.is_empty() && endpoint.bytes().all(|b| b.is_ascii_hexdigit());
            let ssrc_is_numeric = !ssrc.is_empty() && ssrc.bytes().all(|b| b.is_ascii_digit());
            if endpoint_is_hex && ssrc_is_numeric {
                return Self { id: endpoint.to_string(), ssrc: Some(ssrc.to_string()) };
            }
        }
        Self { id: tag.to_string(), ssrc: None }
    }
}

/// The upstream transcription providers the proxy can speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Deepgram,
    Dummy,
}

impl ProviderKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Deepgram => "deepgram",
            Self::Dummy => "dummy",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            "deepgram" => Ok(Self::Deepgram),
            "dummy" => Ok(Self::Dummy),
            other => Err(ScribeError::Policy(format!("unknown provider '{other}'"))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
