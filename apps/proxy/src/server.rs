// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The downstream boundary: `/transcribe` WebSocket accept (with query
//! validation) and `/health`.
//!
//! Parameter problems split two ways: requests with no output sink or
//! malformed values are refused with HTTP 400 before the upgrade, while
//! provider policy failures accept the upgrade and immediately close
//! with code 1002 so the client sees a WebSocket-level diagnostic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use streamscribe_core::{AudioEncoding, ProviderKind, MAX_TAG_LEN};

use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::registry::{self, SessionRegistry};
use crate::session::{spawn_session, OutboundFrame, SessionControl, SessionParams};
use crate::state::AppState;

static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Close codes on the downstream socket.
const CLOSE_POLICY: u16 = 1002;
const CLOSE_INTERNAL: u16 = 1011;

/// Why a `/transcribe` request was not admitted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BoundaryRejection {
    /// Refused before the upgrade with HTTP 400.
    BadRequest(String),
    /// Upgrade accepted, then closed with 1002 and this reason.
    PolicyClose(String),
}

pub fn create_app(config: Config) -> (Router, Arc<AppState>) {
    let registry = Arc::new(Mutex::new(SessionRegistry::new(&config)));
    let state = Arc::new(AppState { config: Arc::new(config), registry });

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/transcribe", get(transcribe_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    (router, state)
}

/// Binds the configured address and serves until a shutdown signal.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let address = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let (app, state) = create_app(config);

    info!(address = %address, version = env!("CARGO_PKG_VERSION"), "proxy listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install ctrl-c handler, running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received, closing sessions");
    registry::shutdown(&state.registry).await;
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn transcribe_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let pending = match validate_params(&state.config, query.as_deref().unwrap_or("")) {
        Ok(params) => Ok(params),
        Err(BoundaryRejection::BadRequest(reason)) => {
            warn!(reason, "rejecting /transcribe request");
            return (StatusCode::BAD_REQUEST, reason).into_response();
        },
        Err(BoundaryRejection::PolicyClose(reason)) => Err(reason),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, pending))
}

/// Parses and validates the `/transcribe` query string.
pub(crate) fn validate_params(
    config: &Config,
    query: &str,
) -> Result<SessionParams, BoundaryRejection> {
    let mut session_id = None;
    let mut language = None;
    let mut provider_name: Option<String> = None;
    let mut encoding = AudioEncoding::Opus;
    let mut send_back = false;
    let mut send_back_interim = false;
    let mut use_dispatcher = false;
    let mut connect_upstream = false;
    let mut tags = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "sessionId" => session_id = Some(value.into_owned()),
            "lang" => language = Some(value.into_owned()),
            "provider" => provider_name = Some(value.into_owned()),
            "encoding" => {
                encoding = match value.as_ref() {
                    "opus" => AudioEncoding::Opus,
                    "ogg-opus" => AudioEncoding::OggOpus,
                    other => {
                        return Err(BoundaryRejection::BadRequest(format!(
                            "unsupported encoding '{other}'"
                        )))
                    },
                };
            },
            "sendBack" => send_back = value == "true",
            "sendBackInterim" => send_back_interim = value == "true",
            "useDispatcher" => use_dispatcher = value == "true",
            "connect" => connect_upstream = value == "true",
            "tag" => {
                if value.len() > MAX_TAG_LEN {
                    return Err(BoundaryRejection::BadRequest(format!(
                        "tag exceeds {MAX_TAG_LEN} characters"
                    )));
                }
                tags.push(value.into_owned());
            },
            other => {
                warn!(param = other, "ignoring unknown /transcribe parameter");
            },
        }
    }

    if !(send_back || send_back_interim || use_dispatcher) {
        return Err(BoundaryRejection::BadRequest(
            "no output sink selected; set sendBack, sendBackInterim or useDispatcher".to_string(),
        ));
    }

    let provider = match provider_name {
        Some(name) => match name.parse::<ProviderKind>() {
            Ok(kind) => kind,
            Err(_) => {
                return Err(BoundaryRejection::PolicyClose(format!("unknown provider '{name}'")))
            },
        },
        None => match config.default_provider() {
            Some(kind) => kind,
            None => {
                return Err(BoundaryRejection::PolicyClose(
                    "no transcription provider is configured".to_string(),
                ))
            },
        },
    };
    if !config.is_provider_available(provider) {
        return Err(BoundaryRejection::PolicyClose(format!(
            "provider '{provider}' is not configured"
        )));
    }

    Ok(SessionParams {
        session_id,
        provider,
        language,
        encoding,
        send_back,
        send_back_interim,
        use_dispatcher,
        connect_upstream,
        tags,
    })
}

async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    pending: Result<SessionParams, String>,
) {
    let metrics = ProxyMetrics::shared();
    let active = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.connections_gauge.record(active, &[]);

    drive_socket(&mut socket, &state, pending).await;

    let prev = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.connections_gauge.record(prev.saturating_sub(1), &[]);
    info!("client connection terminated");
}

async fn drive_socket(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    pending: Result<SessionParams, String>,
) {
    let params = match pending {
        Ok(params) => params,
        Err(reason) => {
            warn!(reason, "closing connection with policy violation");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY,
                    reason: reason.into(),
                })))
                .await;
            return;
        },
    };

    let connection_id = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
    let session_id = params.session_id.clone();
    info!(
        connection_id,
        session_id = ?session_id,
        provider = %params.provider,
        tags = params.tags.len(),
        "accepted /transcribe connection"
    );

    let handle = match &session_id {
        Some(id) => {
            let config = state.config.clone();
            registry::bind_session(&state.registry, id, connection_id, move || {
                spawn_session(config, params)
            })
            .await
        },
        None => spawn_session(state.config.clone(), params),
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(64);
    if handle
        .control_tx
        .send(SessionControl::Attach { outbound: outbound_tx, connection_id })
        .await
        .is_err()
    {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_INTERNAL,
                reason: "session unavailable".into(),
            })))
            .await;
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if handle.client_tx.send(text.to_string()).await.is_err() {
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    warn!(error = %e, "downstream socket error");
                    break;
                },
            },
            frame = outbound_rx.recv() => match frame {
                Some(OutboundFrame::Json(json)) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                },
                Some(OutboundFrame::Close { code, reason }) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                },
                // The session rebound to a newer connection or shut down;
                // release this socket.
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                },
            },
        }
    }

    match &session_id {
        Some(id) => registry::handle_disconnect(&state.registry, id, connection_id).await,
        None => {
            let _ = handle.control_tx.send(SessionControl::Shutdown).await;
        },
    }
}
