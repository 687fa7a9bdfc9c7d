// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Google Gemini Live adapter.
//!
//! Bidirectional setup handshake: the session stays pending until the
//! server answers the `setup` message with `setupComplete`. Gemini never
//! streams deltas; every text part of a model turn is a completed
//! transcription. No mid-stream prompt updates, no commit control.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::transport::{self, websocket_error, WsStream};
use crate::{
    BackendCommand, BackendError, BackendErrorKind, BackendEvent, GeminiSettings, SessionOptions,
    TranscriptEvent,
};

const BIDI_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const PCM_MIME: &str = "audio/pcm;rate=24000";

// --- Outbound messages ---

#[derive(Serialize)]
struct SetupMessage {
    setup: Setup,
}

#[derive(Serialize)]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Serialize)]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Serialize)]
struct RealtimeInput {
    realtime_input: MediaChunks,
}

#[derive(Serialize)]
struct MediaChunks {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize)]
struct MediaChunk {
    mime_type: &'static str,
    data: String,
}

// --- Inbound messages ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
}

fn setup_message(settings: &GeminiSettings, options: &SessionOptions) -> SetupMessage {
    let mut instruction = settings.prompt.clone().unwrap_or_default();
    if let Some(lang) = options.language.as_deref() {
        if !instruction.is_empty() {
            instruction.push(' ');
        }
        instruction.push_str(&format!("The audio is in {lang}."));
    }

    SetupMessage {
        setup: Setup {
            model: format!("models/{}", settings.model),
            generation_config: GenerationConfig { response_modalities: vec!["TEXT"] },
            system_instruction: if instruction.is_empty() {
                None
            } else {
                Some(Content { parts: vec![Part { text: Some(instruction) }] })
            },
        },
    }
}

pub(crate) async fn run(
    settings: GeminiSettings,
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
    settings: &GeminiSettings,
    options: &SessionOptions,
    cmd_rx: &mut mpsc::Receiver<BackendCommand>,
    event_tx: &mpsc::Sender<BackendEvent>,
) -> Result<(), BackendError> {
    let url = format!("{BIDI_URL}?key={}", settings.api_key);
    let mut ws = transport::connect(&url, None).await?;

    transport::send_json(&mut ws, &setup_message(settings, options)).await?;
    match wait_for_setup_complete(&mut ws, cmd_rx).await? {
        SetupOutcome::Ready => {},
        SetupOutcome::ClosedByCaller => return Ok(()),
    }

    if event_tx.send(BackendEvent::Connected).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(BackendCommand::Close) => {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                },
                Some(BackendCommand::SendAudio(data)) => {
                    let input = RealtimeInput {
                        realtime_input: MediaChunks {
                            media_chunks: vec![MediaChunk {
                                mime_type: PCM_MIME,
                                data: BASE64.encode(&data),
                            }],
                        },
                    };
                    transport::send_json(&mut ws, &input).await?;
                },
                Some(BackendCommand::ForceCommit) => {
                    debug!("gemini has no commit control; ignoring force commit");
                },
                Some(BackendCommand::UpdatePrompt(_)) => {
                    debug!("gemini system instruction is fixed at setup; ignoring prompt update");
                },
            },
            msg = ws.next() => {
                for event in handle_server_message(msg)? {
                    if event_tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            },
        }
    }
}

/// How the setup handshake ended short of a provider failure.
enum SetupOutcome {
    Ready,
    /// The pipeline asked for teardown before `setupComplete` arrived.
    ClosedByCaller,
}

async fn wait_for_setup_complete(
    ws: &mut WsStream,
    cmd_rx: &mut mpsc::Receiver<BackendCommand>,
) -> Result<SetupOutcome, BackendError> {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(BackendCommand::Close) => {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(SetupOutcome::ClosedByCaller);
                },
                Some(_) => {
                    warn!("dropping command received before setup completed");
                },
            },
            msg = ws.next() => {
                // Setup acknowledgements arrive as text or binary JSON
                // depending on the transport.
                let raw = match msg {
                    Some(Ok(Message::Text(text))) => Some(text.as_bytes().to_vec()),
                    Some(Ok(Message::Binary(data))) => Some(data.to_vec()),
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(BackendError::new(
                            BackendErrorKind::ConnectionFailed,
                            "socket closed during setup handshake",
                        ));
                    },
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        return Err(BackendError::new(
                            BackendErrorKind::ConnectionFailed,
                            e.to_string(),
                        ));
                    },
                };
                let Some(raw) = raw else { continue };
                if let Ok(parsed) = serde_json::from_slice::<ServerMessage>(&raw) {
                    if let Some(error) = parsed.error {
                        return Err(BackendError::new(BackendErrorKind::Api, error.to_string()));
                    }
                    if parsed.setup_complete.is_some() {
                        return Ok(SetupOutcome::Ready);
                    }
                }
            },
        }
    }
}

fn handle_server_message(
    msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<Vec<BackendEvent>, BackendError> {
    match msg {
        Some(Ok(Message::Text(text))) => {
            let parsed: ServerMessage = match serde_json::from_str(&text) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable gemini message");
                    return Ok(Vec::new());
                },
            };
            if let Some(error) = parsed.error {
                return Err(BackendError::new(BackendErrorKind::Api, error.to_string()));
            }
            let parts = parsed
                .server_content
                .and_then(|content| content.model_turn)
                .map(|turn| turn.parts)
                .unwrap_or_default();
            Ok(parts
                .into_iter()
                .filter_map(|part| part.text)
                .filter(|text| !text.is_empty())
                .map(|text| {
                    BackendEvent::Complete(TranscriptEvent {
                        text,
                        confidence: None,
                        language: None,
                    })
                })
                .collect())
        },
        // Gemini sends JSON as binary frames on some transports; decode both.
        Some(Ok(Message::Binary(data))) => {
            let text = String::from_utf8_lossy(&data).into_owned();
            handle_server_message(Some(Ok(Message::Text(text.into()))))
        },
        Some(Ok(Message::Close(frame))) => {
            Err(websocket_error(format!("provider closed the session: {frame:?}")))
        },
        Some(Ok(_)) => Ok(Vec::new()),
        Some(Err(e)) => Err(websocket_error(e.to_string())),
        None => Err(websocket_error("provider socket ended unexpectedly")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn settings() -> GeminiSettings {
        GeminiSettings {
            api_key: "g-key".to_string(),
            model: "gemini-2.0-flash-live-001".to_string(),
            prompt: Some("Transcribe the meeting audio.".to_string()),
        }
    }

    #[test]
    fn setup_message_includes_model_and_instruction() {
        let options = SessionOptions { language: Some("fr".to_string()), ..Default::default() };
        let value = serde_json::to_value(setup_message(&settings(), &options)).unwrap();

        assert_eq!(value["setup"]["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(value["setup"]["generation_config"]["response_modalities"][0], "TEXT");
        let text = value["setup"]["system_instruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Transcribe the meeting audio."));
        assert!(text.ends_with("The audio is in fr."));
    }

    #[test]
    fn setup_without_prompt_or_language_omits_instruction() {
        let mut s = settings();
        s.prompt = None;
        let value = serde_json::to_value(setup_message(&s, &SessionOptions::default())).unwrap();
        assert!(value["setup"].get("system_instruction").is_none());
    }

    #[test]
    fn model_turn_text_parts_emit_completions() {
        let text = r#"{
            "serverContent": {"modelTurn": {"parts": [{"text": "bonjour"}, {"text": "le monde"}]}}
        }"#;
        let events = handle_server_message(Some(Ok(Message::Text(text.into())))).unwrap();
        assert_eq!(events.len(), 2);
        for event in &events {
            assert!(matches!(event, BackendEvent::Complete(_)));
        }
    }

    #[test]
    fn error_field_is_fatal() {
        let text = r#"{"error": {"code": 400, "message": "bad setup"}}"#;
        let err = handle_server_message(Some(Ok(Message::Text(text.into())))).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Api);
        assert!(err.message.contains("bad setup"));
    }

    #[test]
    fn binary_frames_are_decoded_as_json() {
        let text = r#"{"serverContent": {"modelTurn": {"parts": [{"text": "hi"}]}}}"#;
        let events =
            handle_server_message(Some(Ok(Message::Binary(text.as_bytes().to_vec().into()))))
                .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn non_text_parts_are_skipped() {
        let text = r#"{"serverContent": {"modelTurn": {"parts": [{"inlineData": {}}]}}}"#;
        let events = handle_server_message(Some(Ok(Message::Text(text.into())))).unwrap();
        assert!(events.is_empty());
    }
}
