// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Upstream provider adapters.
//!
//! Every provider session is an actor task that owns its WebSocket and is
//! driven through a FIFO command channel; the [`Backend`] handle is the
//! uniform surface the pipeline talks to. Provider events flow back over a
//! per-backend event channel:
//!
//! `pending → connected → (closed | failed)`, with `Closed` emitted
//! exactly once no matter how the actor terminates.

pub mod deepgram;
pub mod dummy;
pub mod gemini;
pub mod openai;
mod transport;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use streamscribe_core::{AudioFormat, ProviderKind};

/// Command channel depth per backend; sends are small JSON/binary frames.
const COMMAND_CAPACITY: usize = 64;

/// Connection state of a backend, mirrored by the owning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Pending,
    Connected,
    Failed,
    Closed,
}

/// Error category, aligned with the wire-level diagnostics the session
/// reports downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Transport-level failure while establishing the upstream session.
    ConnectionFailed,
    /// Protocol-level rejection returned by the provider.
    Api,
    /// Upstream socket error or abrupt close after connect.
    WebSocket,
    /// Operation requires a connected backend.
    NotReady,
    /// The backend actor has already terminated.
    Closed,
}

impl BackendErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::Api => "api_error",
            Self::WebSocket => "websocket_error",
            Self::NotReady => "not_ready",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// One transcription hypothesis reported by a provider.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    pub confidence: Option<f64>,
    pub language: Option<String>,
}

/// Events emitted by a backend actor towards its pipeline.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// The upstream session accepts audio from now on.
    Connected,
    Interim(TranscriptEvent),
    Complete(TranscriptEvent),
    Error { kind: BackendErrorKind, message: String },
    /// Terminal; emitted exactly once.
    Closed,
}

/// Commands accepted by every backend actor. Ordering per backend follows
/// from the FIFO command channel.
#[derive(Debug)]
pub enum BackendCommand {
    SendAudio(Bytes),
    ForceCommit,
    UpdatePrompt(String),
    Close,
}

/// Per-session options handed to a backend at spawn time.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// ISO-639-1 hint from the `/transcribe` query.
    pub language: Option<String>,
    /// Client-supplied tags, forwarded to providers that accept them.
    pub tags: Vec<String>,
    /// Encoding of the audio the client sends for this session.
    pub input_format: AudioFormat,
}

/// Audio format the backend wants from the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatPolicy {
    /// Decoded PCM16 at 24 kHz.
    Pcm24k,
    /// The client's compressed stream, untouched.
    PassThrough,
}

// --- Provider settings ---

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub prompt: Option<String>,
    /// Raw turn-detection JSON; `None` selects the server-VAD default.
    pub turn_detection: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepgramEncoding {
    /// Forward the client's Opus stream as-is.
    Opus,
    /// Decode locally and stream linear PCM16.
    Linear16,
}

#[derive(Debug, Clone)]
pub struct DeepgramSettings {
    pub api_key: String,
    pub model: Option<String>,
    pub language: Option<String>,
    pub encoding: DeepgramEncoding,
    pub punctuate: bool,
    pub diarize: bool,
    /// Append the detected language to each transcript.
    pub include_language: bool,
    pub tags: Vec<String>,
}

/// Resolved configuration for one provider session.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiSettings),
    Gemini(GeminiSettings),
    Deepgram(DeepgramSettings),
    Dummy,
}

impl ProviderConfig {
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::OpenAi(_) => ProviderKind::OpenAi,
            Self::Gemini(_) => ProviderKind::Gemini,
            Self::Deepgram(_) => ProviderKind::Deepgram,
            Self::Dummy => ProviderKind::Dummy,
        }
    }

    const fn format_policy(&self) -> FormatPolicy {
        match self {
            Self::Deepgram(settings) => match settings.encoding {
                DeepgramEncoding::Opus => FormatPolicy::PassThrough,
                DeepgramEncoding::Linear16 => FormatPolicy::Pcm24k,
            },
            Self::OpenAi(_) | Self::Gemini(_) | Self::Dummy => FormatPolicy::Pcm24k,
        }
    }
}

/// Handle to a running backend actor.
///
/// All methods enqueue onto the actor's command channel; a send failure
/// means the actor is gone, reported as [`BackendErrorKind::Closed`].
#[derive(Debug)]
pub struct Backend {
    provider: ProviderKind,
    format_policy: FormatPolicy,
    cmd_tx: mpsc::Sender<BackendCommand>,
}

impl Backend {
    pub const fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// The format the pipeline should feed this backend. Pure: the pipeline
    /// consults it once, at creation, to decide whether to decode.
    pub const fn desired_audio_format(&self, input: &AudioFormat) -> AudioFormat {
        match self.format_policy {
            FormatPolicy::Pcm24k => AudioFormat::pcm(24_000),
            FormatPolicy::PassThrough => *input,
        }
    }

    /// Forwards one audio chunk. Encoding (base64 vs binary) is the
    /// adapter's concern; exactly one upstream append per call.
    ///
    /// # Errors
    ///
    /// Fails when the backend actor has terminated.
    pub async fn send_audio(&self, data: Bytes) -> Result<(), BackendError> {
        self.send(BackendCommand::SendAudio(data)).await
    }

    /// Asks the provider to flush pending audio and finalize now.
    /// Providers without such a control treat this as a no-op.
    ///
    /// # Errors
    ///
    /// Fails when the backend actor has terminated.
    pub async fn force_commit(&self) -> Result<(), BackendError> {
        self.send(BackendCommand::ForceCommit).await
    }

    /// Replaces the transcription prompt mid-stream where the provider
    /// supports it; otherwise the adapter skips it.
    ///
    /// # Errors
    ///
    /// Fails when the backend actor has terminated.
    pub async fn update_prompt(&self, prompt: String) -> Result<(), BackendError> {
        self.send(BackendCommand::UpdatePrompt(prompt)).await
    }

    /// Requests teardown. Idempotent: repeat calls after the actor exits
    /// are silently ignored, and `Closed` is still emitted exactly once.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(BackendCommand::Close).await;
    }

    async fn send(&self, cmd: BackendCommand) -> Result<(), BackendError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| BackendError::new(BackendErrorKind::Closed, "backend actor terminated"))
    }

    /// Assembles a handle around an externally driven command channel.
    /// Intended for tests that need to observe the command stream.
    pub fn from_parts(
        provider: ProviderKind,
        options: &SessionOptions,
        cmd_tx: mpsc::Sender<BackendCommand>,
    ) -> Self {
        let policy = match provider {
            ProviderKind::Deepgram if options.input_format.is_opus() => FormatPolicy::PassThrough,
            _ => FormatPolicy::Pcm24k,
        };
        Self { provider, format_policy: policy, cmd_tx }
    }
}

/// Spawns the actor for `config` and returns its handle. The actor
/// connects in the background and reports progress on `event_tx`.
pub fn spawn_backend(
    config: ProviderConfig,
    options: SessionOptions,
    event_tx: mpsc::Sender<BackendEvent>,
) -> Backend {
    let provider = config.kind();
    let format_policy = config.format_policy();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);

    tokio::spawn(async move {
        match config {
            ProviderConfig::OpenAi(settings) => {
                openai::run(settings, options, cmd_rx, event_tx).await;
            },
            ProviderConfig::Gemini(settings) => {
                gemini::run(settings, options, cmd_rx, event_tx).await;
            },
            ProviderConfig::Deepgram(settings) => {
                deepgram::run(settings, options, cmd_rx, event_tx).await;
            },
            ProviderConfig::Dummy => {
                dummy::run(cmd_rx, event_tx).await;
            },
        }
    });

    Backend { provider, format_policy, cmd_tx }
}
