// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! OpenAI Realtime transcription adapter.
//!
//! Wire shape: a `session.update` handshake after the socket opens, then
//! base64 `input_audio_buffer.append` frames. The server VAD segments
//! utterances; interim deltas arrive per token batch, completions per
//! utterance. `forceCommit` maps onto `input_audio_buffer.commit`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::transport::{self, websocket_error, WsStream};
use crate::{
    BackendCommand, BackendError, BackendErrorKind, BackendEvent, OpenAiSettings, SessionOptions,
    TranscriptEvent,
};

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime?intent=transcription";
const AUDIO_RATE: u32 = 24_000;

/// Benign race between the idle-commit timer and the server VAD having
/// already consumed the buffer; recognized and suppressed.
const IGNORED_ERROR_CODE: &str = "input_audio_buffer_commit_empty";

/// Server-VAD defaults applied when no turn-detection override is set.
pub fn default_turn_detection() -> serde_json::Value {
    serde_json::json!({
        "type": "server_vad",
        "threshold": 0.5,
        "prefix_padding_ms": 300,
        "silence_duration_ms": 300,
    })
}

// --- Outbound messages ---

#[derive(Serialize)]
struct SessionUpdate<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session: SessionConfig<'a>,
}

#[derive(Serialize)]
struct SessionConfig<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    audio: AudioConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include: Option<Vec<&'static str>>,
}

#[derive(Serialize)]
struct AudioConfig<'a> {
    input: AudioInput<'a>,
}

#[derive(Serialize)]
struct AudioInput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<PcmFormat>,
    transcription: TranscriptionConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_detection: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    noise_reduction: Option<NoiseReduction>,
}

#[derive(Serialize)]
struct PcmFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    rate: u32,
}

#[derive(Serialize)]
struct NoiseReduction {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct TranscriptionConfig<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

#[derive(Serialize)]
struct AudioAppend {
    #[serde(rename = "type")]
    kind: &'static str,
    audio: String,
}

#[derive(Serialize)]
struct TypeOnly {
    #[serde(rename = "type")]
    kind: &'static str,
}

// --- Inbound messages ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    Delta {
        delta: String,
        #[serde(default)]
        logprobs: Option<Vec<LogProb>>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    Completed {
        transcript: String,
        #[serde(default)]
        logprobs: Option<Vec<LogProb>>,
    },
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct LogProb {
    logprob: f64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

fn confidence_from(logprobs: Option<&Vec<LogProb>>) -> Option<f64> {
    logprobs.and_then(|lp| lp.first()).map(|lp| lp.logprob.exp())
}

fn full_session_update<'a>(
    settings: &'a OpenAiSettings,
    options: &'a SessionOptions,
    turn_detection: &'a serde_json::Value,
) -> SessionUpdate<'a> {
    SessionUpdate {
        kind: "session.update",
        session: SessionConfig {
            kind: "transcription",
            audio: AudioConfig {
                input: AudioInput {
                    format: Some(PcmFormat { kind: "audio/pcm", rate: AUDIO_RATE }),
                    transcription: TranscriptionConfig {
                        model: &settings.model,
                        language: options.language.as_deref(),
                        prompt: settings.prompt.as_deref(),
                    },
                    turn_detection: Some(turn_detection),
                    noise_reduction: Some(NoiseReduction { kind: "near_field" }),
                },
            },
            include: Some(vec!["item.input_audio_transcription.logprobs"]),
        },
    }
}

/// Trimmed update used for mid-stream prompt changes: only the
/// transcription block, so the session format and VAD stay untouched.
fn prompt_session_update<'a>(
    settings: &'a OpenAiSettings,
    options: &'a SessionOptions,
    prompt: &'a str,
) -> SessionUpdate<'a> {
    SessionUpdate {
        kind: "session.update",
        session: SessionConfig {
            kind: "transcription",
            audio: AudioConfig {
                input: AudioInput {
                    format: None,
                    transcription: TranscriptionConfig {
                        model: &settings.model,
                        language: options.language.as_deref(),
                        prompt: Some(prompt),
                    },
                    turn_detection: None,
                    noise_reduction: None,
                },
            },
            include: None,
        },
    }
}

pub(crate) async fn run(
    settings: OpenAiSettings,
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
    settings: &OpenAiSettings,
    options: &SessionOptions,
    cmd_rx: &mut mpsc::Receiver<BackendCommand>,
    event_tx: &mpsc::Sender<BackendEvent>,
) -> Result<(), BackendError> {
    let key_protocol = format!("openai-insecure-api-key.{}", settings.api_key);
    let mut ws =
        transport::connect(REALTIME_URL, Some(&["realtime", key_protocol.as_str()])).await?;

    let turn_detection =
        settings.turn_detection.clone().unwrap_or_else(default_turn_detection);
    transport::send_json(&mut ws, &full_session_update(settings, options, &turn_detection))
        .await?;

    // The session is usable once the server acknowledges the update.
    match wait_for_session_ack(&mut ws, cmd_rx).await? {
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
                    use futures_util::SinkExt;
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                },
                Some(BackendCommand::SendAudio(data)) => {
                    let append =
                        AudioAppend { kind: "input_audio_buffer.append", audio: BASE64.encode(&data) };
                    transport::send_json(&mut ws, &append).await?;
                },
                Some(BackendCommand::ForceCommit) => {
                    transport::send_json(&mut ws, &TypeOnly { kind: "input_audio_buffer.commit" })
                        .await?;
                },
                Some(BackendCommand::UpdatePrompt(prompt)) => {
                    transport::send_json(&mut ws, &prompt_session_update(settings, options, &prompt))
                        .await?;
                },
            },
            msg = ws.next() => {
                let Some(event) = handle_server_message(msg)? else {
                    continue;
                };
                if event_tx.send(event).await.is_err() {
                    // Pipeline is gone; nothing left to report to.
                    return Ok(());
                }
            },
        }
    }
}

/// How the setup handshake ended short of a provider failure.
enum SetupOutcome {
    Ready,
    /// The pipeline asked for teardown before the session was usable.
    ClosedByCaller,
}

async fn wait_for_session_ack(
    ws: &mut WsStream,
    cmd_rx: &mut mpsc::Receiver<BackendCommand>,
) -> Result<SetupOutcome, BackendError> {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(BackendCommand::Close) => {
                    use futures_util::SinkExt;
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(SetupOutcome::ClosedByCaller);
                },
                Some(_) => {
                    warn!("dropping command received before session setup completed");
                },
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text.contains("\"error\"") {
                        if let Ok(ServerMessage::Error { error }) = serde_json::from_str(&text) {
                            return Err(BackendError::new(BackendErrorKind::Api, error.message));
                        }
                    }
                    if text.contains("session.created") || text.contains("session.updated") {
                        return Ok(SetupOutcome::Ready);
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(BackendError::new(
                        BackendErrorKind::ConnectionFailed,
                        "socket closed during session setup",
                    ));
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    return Err(BackendError::new(BackendErrorKind::ConnectionFailed, e.to_string()));
                },
            },
        }
    }
}

/// Maps one socket read onto an optional backend event.
fn handle_server_message(
    msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<Option<BackendEvent>, BackendError> {
    match msg {
        Some(Ok(Message::Text(text))) => {
            let parsed: ServerMessage = match serde_json::from_str(&text) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable realtime event");
                    return Ok(None);
                },
            };
            match parsed {
                ServerMessage::Delta { delta, logprobs } => {
                    Ok(Some(BackendEvent::Interim(TranscriptEvent {
                        text: delta,
                        confidence: confidence_from(logprobs.as_ref()),
                        language: None,
                    })))
                },
                ServerMessage::Completed { transcript, logprobs } => {
                    Ok(Some(BackendEvent::Complete(TranscriptEvent {
                        text: transcript,
                        confidence: confidence_from(logprobs.as_ref()),
                        language: None,
                    })))
                },
                ServerMessage::Error { error } => {
                    if error.code.as_deref() == Some(IGNORED_ERROR_CODE) {
                        debug!("suppressing empty-commit error from VAD race");
                        Ok(None)
                    } else {
                        Err(BackendError::new(BackendErrorKind::Api, error.message))
                    }
                },
                ServerMessage::Other => Ok(None),
            }
        },
        Some(Ok(Message::Close(frame))) => {
            Err(websocket_error(format!("provider closed the session: {frame:?}")))
        },
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => Err(websocket_error(e.to_string())),
        None => Err(websocket_error("provider socket ended unexpectedly")),
    }
}
