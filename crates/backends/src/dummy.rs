// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Loopback backend for load tests and wiring checks.
//!
//! Accepts PCM16 at 24 kHz, counts what it swallows, never transcribes.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{BackendCommand, BackendEvent};

pub(crate) async fn run(
    mut cmd_rx: mpsc::Receiver<BackendCommand>,
    event_tx: mpsc::Sender<BackendEvent>,
) {
    let mut bytes_received: u64 = 0;
    let mut samples_received: u64 = 0;

    if event_tx.send(BackendEvent::Connected).await.is_err() {
        return;
    }

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            BackendCommand::SendAudio(data) => {
                bytes_received += data.len() as u64;
                samples_received += data.len() as u64 / 2;
            },
            BackendCommand::ForceCommit => {
                debug!("dummy backend ignoring force commit");
            },
            BackendCommand::UpdatePrompt(_) => {
                debug!("dummy backend ignoring prompt update");
            },
            BackendCommand::Close => break,
        }
    }

    info!(bytes_received, samples_received, "dummy backend session finished");
    let _ = event_tx.send(BackendEvent::Closed).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{spawn_backend, ProviderConfig, SessionOptions};
    use bytes::Bytes;
    use streamscribe_core::AudioFormat;

    #[tokio::test]
    async fn dummy_connects_counts_and_closes_once() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let backend = spawn_backend(
            ProviderConfig::Dummy,
            SessionOptions {
                language: None,
                tags: Vec::new(),
                input_format: AudioFormat::opus(),
            },
            event_tx,
        );

        assert!(matches!(event_rx.recv().await, Some(BackendEvent::Connected)));

        backend.send_audio(Bytes::from(vec![0u8; 960])).await.unwrap();
        backend.force_commit().await.unwrap();
        backend.close().await;
        // A second close must be harmless.
        backend.close().await;

        assert!(matches!(event_rx.recv().await, Some(BackendEvent::Closed)));
        // Exactly one Closed: the channel ends after the actor exits.
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dummy_emits_no_transcriptions() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let backend = spawn_backend(
            ProviderConfig::Dummy,
            SessionOptions {
                language: None,
                tags: Vec::new(),
                input_format: AudioFormat::opus(),
            },
            event_tx,
        );

        assert!(matches!(event_rx.recv().await, Some(BackendEvent::Connected)));
        for _ in 0..10 {
            backend.send_audio(Bytes::from(vec![0u8; 480])).await.unwrap();
        }
        backend.close().await;

        match event_rx.recv().await {
            Some(BackendEvent::Closed) => {},
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
