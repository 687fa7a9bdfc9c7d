// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! JSON wire messages exchanged with the downstream client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Participant;

/// One media frame from the client.
///
/// `timestamp` is an RTP-style clock in 48 kHz ticks; `chunk` is a
/// per-tag monotonic sequence counter. Both are optional: clients that do
/// not track sequencing simply omit them and forgo loss concealment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub tag: String,
    /// Base64-encoded audio bytes. Absent payloads are dropped upstream.
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Inbound client events, discriminated on the `event` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientEvent {
    Ping {
        #[serde(default)]
        id: Option<i64>,
    },
    Media {
        media: MediaPayload,
    },
    /// Anything we do not understand; logged and dropped by the session.
    #[serde(other)]
    Unknown,
}

/// Outbound control events.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ServerEvent {
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
    },
}

/// One hypothesis within a transcription result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptAlternative {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The canonical transcription message delivered to the client,
/// identical in shape for every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub transcript: Vec<TranscriptAlternative>,
    pub is_interim: bool,
    pub message_id: String,
    pub participant: Participant,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

pub const TRANSCRIPTION_RESULT_EVENT: &str = "transcription-result";

impl TranscriptionResult {
    pub fn new(
        participant: Participant,
        text: String,
        confidence: Option<f64>,
        is_interim: bool,
        timestamp: u64,
        language: Option<String>,
    ) -> Self {
        Self {
            kind: TRANSCRIPTION_RESULT_EVENT.to_string(),
            event: TRANSCRIPTION_RESULT_EVENT.to_string(),
            transcript: vec![TranscriptAlternative { text, confidence }],
            is_interim,
            message_id: Uuid::new_v4().to_string(),
            participant,
            timestamp,
            language,
        }
    }

    /// Primary hypothesis text, empty string when the provider sent none.
    pub fn text(&self) -> &str {
        self.transcript.first().map_or("", |alt| alt.text.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ping_event_parses_with_and_without_id() {
        let ev: ClientEvent = serde_json::from_str(r#"{"event":"ping","id":7}"#).unwrap();
        assert!(matches!(ev, ClientEvent::Ping { id: Some(7) }));

        let ev: ClientEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::Ping { id: None }));
    }

    #[test]
    fn media_event_parses_sequencing_fields() {
        let ev: ClientEvent = serde_json::from_str(
            r#"{"event":"media","media":{"tag":"p1-100","payload":"AAAA","chunk":3,"timestamp":2880}}"#,
        )
        .unwrap();
        let ClientEvent::Media { media } = ev else {
            panic!("expected media event");
        };
        assert_eq!(media.tag, "p1-100");
        assert_eq!(media.chunk, Some(3));
        assert_eq!(media.timestamp, Some(2880));
    }

    #[test]
    fn unrecognized_event_maps_to_unknown() {
        let ev: ClientEvent = serde_json::from_str(r#"{"event":"subscribe","topic":"x"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::Unknown));
    }

    #[test]
    fn pong_serializes_without_null_id() {
        let json = serde_json::to_string(&ServerEvent::Pong { id: None }).unwrap();
        assert_eq!(json, r#"{"event":"pong"}"#);

        let json = serde_json::to_string(&ServerEvent::Pong { id: Some(7) }).unwrap();
        assert_eq!(json, r#"{"event":"pong","id":7}"#);
    }

    #[test]
    fn transcription_result_carries_both_discriminators() {
        let msg = TranscriptionResult::new(
            Participant::from_tag("abc12-456"),
            "hello there".to_string(),
            Some(0.92),
            false,
            1_700_000_000_000,
            Some("en".to_string()),
        );
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "transcription-result");
        assert_eq!(value["event"], "transcription-result");
        assert_eq!(value["is_interim"], false);
        assert_eq!(value["participant"]["id"], "abc12");
        assert_eq!(value["participant"]["ssrc"], "456");
        assert_eq!(value["transcript"][0]["text"], "hello there");
        assert!(!value["message_id"].as_str().unwrap().is_empty());
    }
}
