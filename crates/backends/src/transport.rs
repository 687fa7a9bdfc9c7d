// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared WebSocket plumbing for the provider adapters.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::{BackendError, BackendErrorKind};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn connection_failed(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorKind::ConnectionFailed, message)
}

/// Opens the upstream socket, optionally negotiating subprotocols
/// (several providers smuggle their API key through this header).
pub(crate) async fn connect(
    url: &str,
    subprotocols: Option<&[&str]>,
) -> Result<WsStream, BackendError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| connection_failed(format!("invalid upstream url: {e}")))?;

    if let Some(protocols) = subprotocols {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| connection_failed(format!("invalid subprotocol value: {e}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let (stream, _response) = timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| connection_failed("upstream connection timeout"))?
        .map_err(|e| connection_failed(e.to_string()))?;

    Ok(stream)
}

pub(crate) fn websocket_error(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorKind::WebSocket, message)
}

/// Serializes `value` and sends it as a text frame.
pub(crate) async fn send_json<T: serde::Serialize>(
    ws: &mut WsStream,
    value: &T,
) -> Result<(), BackendError> {
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::Message;

    let json = serde_json::to_string(value)
        .map_err(|e| websocket_error(format!("failed to serialize message: {e}")))?;
    ws.send(Message::Text(json.into())).await.map_err(|e| websocket_error(e.to_string()))
}

/// Sends a pre-rendered JSON control frame.
pub(crate) async fn send_text(ws: &mut WsStream, text: &'static str) -> Result<(), BackendError> {
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::Message;

    ws.send(Message::Text(text.into())).await.map_err(|e| websocket_error(e.to_string()))
}
