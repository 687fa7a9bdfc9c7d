// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge};

/// Process-wide proxy metrics, created lazily on first use.
#[derive(Clone)]
pub struct ProxyMetrics {
    /// Media frames dropped by the ordering guard (replay/reorder).
    pub packets_discarded: Counter<u64>,
    /// Opus frames that failed to decode (non-fatal).
    pub decode_failures: Counter<u64>,
    /// Completed transcriptions delivered by backends.
    pub transcriptions: Counter<u64>,
    /// Downstream WebSocket connections currently open.
    pub connections_gauge: Gauge<u64>,
    /// Sessions successfully resumed after a reconnect.
    pub sessions_resumed: Counter<u64>,
    /// Sessions currently alive (attached or detached).
    pub sessions_active: Gauge<u64>,
}

impl ProxyMetrics {
    pub fn shared() -> Self {
        static METRICS: OnceLock<ProxyMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("streamscribe");
                Self {
                    packets_discarded: meter
                        .u64_counter("opus_packet_discarded")
                        .with_description("Media frames dropped for replay or reordering")
                        .build(),
                    decode_failures: meter
                        .u64_counter("opus_decode_failure")
                        .with_description("Opus frames that failed to decode")
                        .build(),
                    transcriptions: meter
                        .u64_counter("transcription_success")
                        .with_description("Completed transcriptions received from providers")
                        .build(),
                    connections_gauge: meter
                        .u64_gauge("websocket.connections.active")
                        .with_description("Number of active downstream WebSocket connections")
                        .build(),
                    sessions_resumed: meter
                        .u64_counter("sessions.resumed")
                        .with_description("Sessions resumed within the grace period")
                        .build(),
                    sessions_active: meter
                        .u64_gauge("sessions.active")
                        .with_description("Number of live sessions")
                        .build(),
                }
            })
            .clone()
    }
}
