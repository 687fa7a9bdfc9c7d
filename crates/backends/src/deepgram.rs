// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Deepgram live-streaming adapter.
//!
//! The whole session config rides in the listen URL's query string; audio
//! is raw binary frames, control messages are JSON text. Deepgram drops
//! the socket after ~10 s without traffic, so a `KeepAlive` goes out every
//! 5 s. There is no prompt concept: `updatePrompt` is a warn-only no-op.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::{self, websocket_error};
use crate::{
    BackendCommand, BackendError, BackendErrorKind, BackendEvent, DeepgramEncoding,
    DeepgramSettings, SessionOptions, TranscriptEvent,
};
use streamscribe_core::AudioEncoding;

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const KEEPALIVE_MSG: &str = r#"{"type":"KeepAlive"}"#;
const FINALIZE_MSG: &str = r#"{"type":"Finalize"}"#;
const CLOSE_STREAM_MSG: &str = r#"{"type":"CloseStream"}"#;

// --- Inbound messages ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Results {
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        channel: Option<Channel>,
    },
    #[serde(rename = "Error", alias = "error")]
    Error {
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    languages: Vec<String>,
}

/// Builds the listen URL encoding the full session configuration.
///
/// Ogg-framed Opus omits `encoding`/`sample_rate` so the container is
/// auto-detected; raw Opus and linear PCM declare themselves explicitly.
fn build_url(settings: &DeepgramSettings, options: &SessionOptions) -> Result<Url, BackendError> {
    let mut url = Url::parse(LISTEN_URL)
        .map_err(|e| BackendError::new(BackendErrorKind::ConnectionFailed, e.to_string()))?;

    let language = options.language.as_deref().or(settings.language.as_deref());

    {
        let mut query = url.query_pairs_mut();

        match (settings.encoding, options.input_format.encoding) {
            (DeepgramEncoding::Opus, AudioEncoding::OggOpus) => {},
            (DeepgramEncoding::Opus, _) => {
                query.append_pair("encoding", "opus");
                query.append_pair("sample_rate", "48000");
            },
            (DeepgramEncoding::Linear16, _) => {
                query.append_pair("encoding", "linear16");
                query.append_pair("sample_rate", "24000");
            },
        }

        if let Some(model) = settings.model.as_deref() {
            query.append_pair("model", model);
        }
        if let Some(language) = language {
            query.append_pair("language", language);
            if language == "multi" {
                // Multilingual code switching needs aggressive endpointing
                // to keep per-language segments separate.
                query.append_pair("endpointing", "100");
            }
        }
        if settings.punctuate {
            query.append_pair("punctuate", "true");
        }
        if settings.diarize {
            query.append_pair("diarize", "true");
        }
        for tag in settings.tags.iter().chain(options.tags.iter()) {
            query.append_pair("tag", tag);
        }
        query.append_pair("interim_results", "true");
    }

    Ok(url)
}

fn transcript_event(settings: &DeepgramSettings, alt: &Alternative) -> TranscriptEvent {
    let language = alt.languages.first().cloned();
    let mut text = alt.transcript.clone();
    if settings.include_language {
        if let Some(lang) = language.as_deref() {
            text.push_str(&format!(" [{lang}]"));
        }
    }
    TranscriptEvent { text, confidence: alt.confidence, language }
}

pub(crate) async fn run(
    settings: DeepgramSettings,
    options: SessionOptions,
    mut cmd_rx: mpsc::Receiver<BackendCommand>,
    event_tx: mpsc::Sender<BackendEvent>,
) {
    if let Err(e) = drive(&settings, &options, &mut cmd_rx, &event_tx).await {
        let _ = event_tx.send(BackendEvent::Error { kind: e.kind, message: e.message }).await;
    }
    let _ = event_tx.send(BackendEvent::Closed).await;
}

async fn drive(
    settings: &DeepgramSettings,
    options: &SessionOptions,
    cmd_rx: &mut mpsc::Receiver<BackendCommand>,
    event_tx: &mpsc::Sender<BackendEvent>,
) -> Result<(), BackendError> {
    let url = build_url(settings, options)?;
    let mut ws =
        transport::connect(url.as_str(), Some(&["token", settings.api_key.as_str()])).await?;

    // Deepgram accepts audio from the first frame; no handshake round-trip.
    if event_tx.send(BackendEvent::Connected).await.is_err() {
        return Ok(());
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(BackendCommand::Close) => {
                    let _ = transport::send_text(&mut ws, CLOSE_STREAM_MSG).await;
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                },
                Some(BackendCommand::SendAudio(data)) => {
                    ws.send(Message::Binary(data))
                        .await
                        .map_err(|e| websocket_error(e.to_string()))?;
                },
                Some(BackendCommand::ForceCommit) => {
                    transport::send_text(&mut ws, FINALIZE_MSG).await?;
                },
                Some(BackendCommand::UpdatePrompt(_)) => {
                    warn!("deepgram has no prompt support; ignoring prompt update");
                },
            },
            _ = keepalive.tick() => {
                transport::send_text(&mut ws, KEEPALIVE_MSG).await?;
            },
            msg = ws.next() => {
                let Some(event) = handle_server_message(settings, msg)? else {
                    continue;
                };
                if event_tx.send(event).await.is_err() {
                    return Ok(());
                }
            },
        }
    }
}

fn handle_server_message(
    settings: &DeepgramSettings,
    msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<Option<BackendEvent>, BackendError> {
    match msg {
        Some(Ok(Message::Text(text))) => {
            let parsed: ServerMessage = match serde_json::from_str(&text) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable deepgram message");
                    return Ok(None);
                },
            };
            match parsed {
                ServerMessage::Results { is_final, channel } => {
                    let Some(alt) =
                        channel.as_ref().and_then(|c| c.alternatives.first())
                    else {
                        return Ok(None);
                    };
                    if alt.transcript.is_empty() {
                        return Ok(None);
                    }
                    let event = transcript_event(settings, alt);
                    Ok(Some(if is_final {
                        BackendEvent::Complete(event)
                    } else {
                        BackendEvent::Interim(event)
                    }))
                },
                ServerMessage::Error { description } => Err(BackendError::new(
                    BackendErrorKind::Api,
                    description.unwrap_or_else(|| "deepgram error".to_string()),
                )),
                ServerMessage::Other => Ok(None),
            }
        },
        Some(Ok(Message::Close(frame))) => {
            info!(?frame, "deepgram closed the stream");
            Err(websocket_error("provider closed the session"))
        },
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => Err(websocket_error(e.to_string())),
        None => Err(websocket_error("provider socket ended unexpectedly")),
    }
}
