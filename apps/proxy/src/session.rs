// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! One session per client WebSocket: owns the per-tag pipelines, routes
//! media in, fans transcripts out, and broadcasts cross-participant
//! context.
//!
//! The session is an actor: a single task serializes client events,
//! backend events and timer fires, so pipelines never need locks. The
//! attached WebSocket is just a pair of channels and can be swapped at
//! any time (detach/resume, duplicate-connection takeover) without
//! touching in-flight pipelines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use streamscribe_backends::{spawn_backend, BackendErrorKind, BackendEvent, SessionOptions};
use streamscribe_core::{
    AudioEncoding, AudioFormat, ClientEvent, ProviderKind, ServerEvent, TranscriptionResult,
    MAX_TAG_LEN,
};

use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::pipeline::Pipeline;

/// Events fanned into the session task from pipelines, decoders and
/// timers, each tagged with the originating participant.
#[derive(Debug)]
pub enum SessionEvent {
    Backend { tag: String, event: BackendEvent },
    DecoderReady { tag: String },
    DecoderFailed { tag: String, message: String },
    IdleCommit { tag: String },
}

/// Control messages from the connection layer and the registry.
#[derive(Debug)]
pub enum SessionControl {
    /// Bind (or rebind) the downstream socket. Replacing an existing
    /// binding drops the old sender, which closes the previous socket.
    Attach { outbound: mpsc::Sender<OutboundFrame>, connection_id: u64 },
    Shutdown,
}

/// Frames the session hands to whichever connection task is attached.
#[derive(Debug)]
pub enum OutboundFrame {
    Json(String),
    Close { code: u16, reason: String },
}

/// Cheap handle kept by the registry and the connection tasks.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub control_tx: mpsc::Sender<SessionControl>,
    /// Raw inbound JSON text; parsing happens on the session task.
    pub client_tx: mpsc::Sender<String>,
}

/// Validated `/transcribe` query options.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: Option<String>,
    pub provider: ProviderKind,
    pub language: Option<String>,
    pub encoding: AudioEncoding,
    pub send_back: bool,
    pub send_back_interim: bool,
    pub use_dispatcher: bool,
    /// Pre-open upstream sessions for the given tags instead of waiting
    /// for their first media event.
    pub connect_upstream: bool,
    pub tags: Vec<String>,
}

pub struct Session {
    params: SessionParams,
    config: Arc<Config>,
    metrics: ProxyMetrics,
    pipelines: HashMap<String, Pipeline>,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

/// Starts the session actor and returns its handle.
pub fn spawn_session(config: Arc<Config>, params: SessionParams) -> SessionHandle {
    let (control_tx, control_rx) = mpsc::channel(16);
    let (client_tx, client_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);

    let session = Session {
        params,
        config,
        metrics: ProxyMetrics::shared(),
        pipelines: HashMap::new(),
        outbound: None,
        event_tx,
    };
    tokio::spawn(session.run(control_rx, client_rx, event_rx));

    SessionHandle { control_tx, client_tx }
}

impl Session {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<SessionControl>,
        mut client_rx: mpsc::Receiver<String>,
        mut event_rx: mpsc::Receiver<SessionEvent>,
    ) {
        info!(
            session_id = ?self.params.session_id,
            provider = %self.params.provider,
            language = ?self.params.language,
            "session started"
        );

        if self.params.connect_upstream {
            for tag in self.params.tags.clone() {
                self.ensure_pipeline(&tag).await;
            }
        }

        loop {
            tokio::select! {
                // Control first: an Attach queued before client traffic
                // must bind the socket before any reply goes out.
                biased;
                ctrl = control_rx.recv() => match ctrl {
                    Some(SessionControl::Attach { outbound, connection_id }) => {
                        debug!(connection_id, "socket attached to session");
                        self.outbound = Some(outbound);
                    },
                    Some(SessionControl::Shutdown) | None => break,
                },
                Some(text) = client_rx.recv() => {
                    self.handle_client_text(&text).await;
                },
                Some(event) = event_rx.recv() => {
                    self.handle_event(event).await;
                },
            }
        }

        self.teardown().await;
    }

    async fn handle_client_text(&mut self, text: &str) {
        let event: ClientEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, message_len = text.len(), "failed to parse client event");
                return;
            },
        };
        match event {
            ClientEvent::Ping { id } => {
                self.deliver_json(&ServerEvent::Pong { id });
            },
            ClientEvent::Media { media } => {
                if media.tag.is_empty() || media.tag.len() > MAX_TAG_LEN {
                    warn!(tag_len = media.tag.len(), "rejecting media event with invalid tag");
                    return;
                }
                let tag = media.tag.clone();
                if !self.ensure_pipeline(&tag).await {
                    return;
                }
                let metrics = self.metrics.clone();
                if let Some(pipeline) = self.pipelines.get_mut(&tag) {
                    pipeline.handle_media(&media, &metrics).await;
                }
            },
            ClientEvent::Unknown => {
                debug!("ignoring unknown client event");
            },
        }
    }

    /// Creates the pipeline for `tag` on first sight; idempotent per tag
    /// for the session's lifetime.
    async fn ensure_pipeline(&mut self, tag: &str) -> bool {
        if self.pipelines.contains_key(tag) {
            return true;
        }

        let Some(provider_config) = self.config.provider_config(self.params.provider) else {
            error!(provider = %self.params.provider, "provider no longer configured");
            return false;
        };

        let input_format = match self.params.encoding {
            AudioEncoding::OggOpus => AudioFormat::ogg_opus(),
            AudioEncoding::Opus | AudioEncoding::L16 => AudioFormat::opus(),
        };
        let options = SessionOptions {
            language: self.params.language.clone(),
            tags: self.params.tags.clone(),
            input_format,
        };

        let (backend_tx, mut backend_rx) = mpsc::channel(256);
        let backend = spawn_backend(provider_config, options, backend_tx);

        // Tag the backend's events and fan them into the session loop.
        let forward_tag = tag.to_string();
        let forward_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = backend_rx.recv().await {
                if forward_tx
                    .send(SessionEvent::Backend { tag: forward_tag.clone(), event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let timeout = if self.config.force_commit_timeout > 0 {
            Duration::from_secs(self.config.force_commit_timeout.unsigned_abs())
        } else {
            Duration::ZERO
        };

        match Pipeline::new(
            tag.to_string(),
            backend,
            input_format,
            self.config.base_prompt(self.params.provider),
            timeout,
            self.event_tx.clone(),
        ) {
            Ok(pipeline) => {
                info!(tag, provider = %self.params.provider, "participant pipeline created");
                self.pipelines.insert(tag.to_string(), pipeline);
                true
            },
            Err(e) => {
                error!(tag, error = %e, "failed to create participant pipeline");
                false
            },
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Backend { tag, event } => self.handle_backend_event(&tag, event).await,
            SessionEvent::DecoderReady { tag } => {
                let metrics = self.metrics.clone();
                if let Some(pipeline) = self.pipelines.get_mut(&tag) {
                    debug!(tag, "decoder ready, draining queued frames");
                    pipeline.on_decoder_ready(&metrics).await;
                }
            },
            SessionEvent::DecoderFailed { tag, message } => {
                error!(tag, error = %message, "decoder initialization failed");
                if let Some(mut pipeline) = self.pipelines.remove(&tag) {
                    pipeline.on_decoder_failed();
                    pipeline.close().await;
                }
            },
            SessionEvent::IdleCommit { tag } => {
                if let Some(pipeline) = self.pipelines.get_mut(&tag) {
                    pipeline.on_idle_commit().await;
                }
            },
        }
    }

    async fn handle_backend_event(&mut self, tag: &str, event: BackendEvent) {
        match event {
            BackendEvent::Connected => {
                info!(tag, "backend connected, draining pending audio");
                if let Some(pipeline) = self.pipelines.get_mut(tag) {
                    pipeline.on_backend_connected().await;
                }
            },
            BackendEvent::Interim(transcript) => {
                let Some(pipeline) = self.pipelines.get_mut(tag) else {
                    return;
                };
                let timestamp = pipeline.note_interim();
                if self.params.send_back && self.params.send_back_interim {
                    let message = TranscriptionResult::new(
                        pipeline.participant().clone(),
                        transcript.text,
                        transcript.confidence,
                        true,
                        timestamp,
                        transcript.language.or_else(|| self.params.language.clone()),
                    );
                    self.deliver_json(&message);
                }
            },
            BackendEvent::Complete(transcript) => {
                let Some(pipeline) = self.pipelines.get_mut(tag) else {
                    return;
                };
                let timestamp = pipeline.note_complete();
                self.metrics.transcriptions.add(1, &[]);
                let source_id = pipeline.participant().id.clone();

                if self.params.send_back {
                    let message = TranscriptionResult::new(
                        pipeline.participant().clone(),
                        transcript.text.clone(),
                        transcript.confidence,
                        false,
                        timestamp,
                        transcript.language.or_else(|| self.params.language.clone()),
                    );
                    self.deliver_json(&message);
                }

                if self.config.broadcast_transcripts && !transcript.text.is_empty() {
                    self.broadcast_context(tag, &source_id, &transcript.text).await;
                }
            },
            BackendEvent::Error { kind, message } => {
                error!(tag, kind = kind.as_str(), error = %message, "backend failed");
                if let Some(mut pipeline) = self.pipelines.remove(tag) {
                    pipeline.mark_backend_failed();
                    pipeline.close().await;
                }
                if kind == BackendErrorKind::Api {
                    self.deliver_close(1011, format!("backend error for {tag}: {message}"));
                }
            },
            BackendEvent::Closed => {
                debug!(tag, "backend closed");
                if let Some(mut pipeline) = self.pipelines.remove(tag) {
                    pipeline.mark_backend_closed();
                    pipeline.close().await;
                }
            },
        }
    }

    /// Injects one participant's completed transcript into every *other*
    /// pipeline's provider prompt.
    async fn broadcast_context(&mut self, source_tag: &str, source_id: &str, text: &str) {
        let line = format!("{source_id}: {text}\n");
        let max_size = self.config.broadcast_transcripts_max_size;
        for (tag, pipeline) in &mut self.pipelines {
            if tag != source_tag {
                pipeline.add_transcript_context(&line, max_size).await;
            }
        }
    }

    /// Best-effort delivery to the attached socket; dropped with a
    /// warning when no socket is open.
    fn deliver_json<T: Serialize>(&self, message: &T) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize outbound message");
                return;
            },
        };
        let Some(outbound) = &self.outbound else {
            warn!("no client socket attached, dropping outbound message");
            return;
        };
        if let Err(e) = outbound.try_send(OutboundFrame::Json(json)) {
            warn!(error = %e, "client socket not writable, dropping outbound message");
        }
    }

    fn deliver_close(&self, code: u16, reason: String) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.try_send(OutboundFrame::Close { code, reason });
        }
    }

    async fn teardown(&mut self) {
        info!(
            session_id = ?self.params.session_id,
            pipelines = self.pipelines.len(),
            "session closing"
        );
        for (_, mut pipeline) in self.pipelines.drain() {
            pipeline.close().await;
        }
        self.deliver_close(1000, "session closed".to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.enable_dummy_provider = true;
        config.broadcast_transcripts = true;
        config.broadcast_transcripts_max_size = 1024;
        Arc::new(config)
    }

    fn dummy_params(send_back: bool) -> SessionParams {
        SessionParams {
            session_id: None,
            provider: ProviderKind::Dummy,
            language: None,
            encoding: AudioEncoding::Opus,
            send_back,
            send_back_interim: false,
            use_dispatcher: false,
            connect_upstream: false,
            tags: Vec::new(),
        }
    }

    async fn attach(
        handle: &SessionHandle,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        handle
            .control_tx
            .send(SessionControl::Attach { outbound: outbound_tx, connection_id: 1 })
            .await
            .unwrap();
        outbound_rx
    }

    #[tokio::test]
    async fn ping_round_trip_echoes_id() {
        let handle = spawn_session(test_config(), dummy_params(true));
        let mut outbound = attach(&handle).await;

        handle.client_tx.send(r#"{"event":"ping","id":7}"#.to_string()).await.unwrap();
        let Some(OutboundFrame::Json(json)) = outbound.recv().await else {
            panic!("expected pong");
        };
        assert_eq!(json, r#"{"event":"pong","id":7}"#);

        handle.control_tx.send(SessionControl::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn parse_failures_do_not_disconnect() {
        let handle = spawn_session(test_config(), dummy_params(true));
        let mut outbound = attach(&handle).await;

        handle.client_tx.send("{not json".to_string()).await.unwrap();
        handle.client_tx.send(r#"{"event":"subscribe"}"#.to_string()).await.unwrap();
        handle.client_tx.send(r#"{"event":"ping","id":1}"#.to_string()).await.unwrap();

        // The session is still alive and answers the later ping.
        let Some(OutboundFrame::Json(json)) = outbound.recv().await else {
            panic!("expected pong after bad input");
        };
        assert!(json.contains("pong"));

        handle.control_tx.send(SessionControl::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn media_creates_one_pipeline_per_tag() {
        let handle = spawn_session(test_config(), dummy_params(false));
        let _outbound = attach(&handle).await;

        let media = |chunk: i64| {
            format!(
                r#"{{"event":"media","media":{{"tag":"p1-100","payload":"QUFBQQ==","chunk":{chunk},"timestamp":{}}}}}"#,
                chunk * 960
            )
        };
        for chunk in 0..3 {
            handle.client_tx.send(media(chunk)).await.unwrap();
        }

        // No response expected from the dummy backend; the session stays up.
        handle.client_tx.send(r#"{"event":"ping"}"#.to_string()).await.unwrap();
        handle.control_tx.send(SessionControl::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn completed_transcripts_reach_every_other_pipeline() {
        use crate::pipeline::Pipeline;
        use streamscribe_backends::{Backend, BackendCommand, TranscriptEvent};

        let config = test_config();
        let (event_tx, _event_rx) = mpsc::channel(64);
        let mut session = Session {
            params: dummy_params(false),
            config: config.clone(),
            metrics: ProxyMetrics::shared(),
            pipelines: HashMap::new(),
            outbound: None,
            event_tx: event_tx.clone(),
        };

        let mut command_rxs = HashMap::new();
        for tag in ["alice-1", "bob-2"] {
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let options = SessionOptions {
                language: None,
                tags: Vec::new(),
                input_format: AudioFormat::opus(),
            };
            let backend = Backend::from_parts(ProviderKind::Deepgram, &options, cmd_tx);
            let pipeline = Pipeline::new(
                tag.to_string(),
                backend,
                AudioFormat::opus(),
                String::new(),
                Duration::ZERO,
                event_tx.clone(),
            )
            .unwrap();
            session.pipelines.insert(tag.to_string(), pipeline);
            command_rxs.insert(tag, cmd_rx);
        }

        let transcript = TranscriptEvent {
            text: "hello".to_string(),
            confidence: Some(0.9),
            language: None,
        };
        session.handle_backend_event("alice-1", BackendEvent::Complete(transcript)).await;

        // bob-2 gets the context line attributed to alice's participant
        // id ("alice-1" is not hex-ssrc shaped, so the full tag is the id).
        let Some(BackendCommand::UpdatePrompt(prompt)) =
            command_rxs.get_mut("bob-2").unwrap().recv().await
        else {
            panic!("expected prompt update on the peer pipeline");
        };
        assert!(prompt.ends_with("alice-1: hello\n"), "prompt was: {prompt}");

        // The source pipeline must not hear its own transcript back.
        assert!(command_rxs.get_mut("alice-1").unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_the_attached_socket_normally() {
        let handle = spawn_session(test_config(), dummy_params(true));
        let mut outbound = attach(&handle).await;

        handle.control_tx.send(SessionControl::Shutdown).await.unwrap();
        match outbound.recv().await {
            Some(OutboundFrame::Close { code, .. }) => assert_eq!(code, 1000),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
