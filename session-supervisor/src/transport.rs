//! Transport Factory (C4): the raw byte-stream abstraction underneath the
//! framed protocol in [`crate::connection`]. Grounded on the teacher's
//! `ConnectionInformation` in `backbone-lib/src/web_socket_interface.rs`
//! (`send_binary`/`try_recv_binary` over `ewebsock`), generalized from a
//! native/WASM split to a real-vs-offline split: a `tokio-tungstenite`
//! WebSocket for real deployments (the teacher never needed a native-only
//! websocket client, only the WASM/native dual target; `praxiomlabs-mcpkit`
//! is where this crate's `tokio-tungstenite` pin comes from) and an
//! in-process channel pair backed by `offline-backend` for development.

use crate::config::Endpoint;
use crate::error::{RawTransportError, TimeoutSource};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// A bidirectional framed byte transport. One instance per connection
/// attempt; exclusively owned by [`crate::connection::ServerConnection`] and
/// dropped on attempt exit (spec §9 "shared resources via ownership").
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), RawTransportError>;

    /// Waits for the next inbound frame. Returns `Ok(None)` only once the
    /// peer has performed an orderly close with no payload.
    async fn recv_binary(&mut self) -> Result<Option<Vec<u8>>, RawTransportError>;

    /// Closes the transport, optionally attaching an opaque close payload
    /// (spec §9 "pause-termination marker" — the object-identity sentinel
    /// becomes a literal byte marker here, see [`crate::supervisor::PAUSE_CLOSE_MARKER`]).
    async fn close(&mut self, payload: Option<Vec<u8>>);
}

/// Establishes a transport for `endpoint`, dispatching to the offline or
/// real implementation based on [`Endpoint::offline`].
pub async fn connect(
    endpoint: &Endpoint,
    connect_timeout: Duration,
) -> Result<Box<dyn Transport>, RawTransportError> {
    if endpoint.offline {
        Ok(Box::new(OfflineTransport::connect()))
    } else {
        Ok(Box::new(WebSocketTransport::connect(endpoint, connect_timeout).await?))
    }
}

/// In-process transport backed by the embedded simulated backend (spec
/// glossary "Offline mode"). No network, no TLS, no retry semantics — the
/// `offline-backend` crate's `Session` already behaves like a perfectly
/// reliable link.
pub struct OfflineTransport {
    session: offline_backend::Session,
}

impl OfflineTransport {
    pub fn connect() -> Self {
        Self {
            session: offline_backend::Session::spawn(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for OfflineTransport {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), RawTransportError> {
        self.session
            .send(data)
            .map_err(|_| RawTransportError::StreamClosed)
    }

    async fn recv_binary(&mut self) -> Result<Option<Vec<u8>>, RawTransportError> {
        Ok(self.session.recv().await)
    }

    async fn close(&mut self, _payload: Option<Vec<u8>>) {
        self.session.close();
    }
}

/// Real WebSocket transport over TLS, the counterpart to the teacher's
/// native `ewebsock` path.
pub struct WebSocketTransport {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl WebSocketTransport {
    async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self, RawTransportError> {
        let scheme = if endpoint.tls { "wss" } else { "ws" };
        let url = format!("{scheme}://{}:{}/", endpoint.host, endpoint.port);

        let (stream, _response) = tokio::time::timeout(
            connect_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await
        .map_err(|_| RawTransportError::StreamTimeout(TimeoutSource::Connect))?
        .map_err(|err| classify_connect_error(&err))?;

        Ok(Self { stream })
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), RawTransportError> {
        self.stream
            .send(WsMessage::Binary(data.into()))
            .await
            .map_err(|_| RawTransportError::StreamClosed)
    }

    async fn recv_binary(&mut self) -> Result<Option<Vec<u8>>, RawTransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Err(RawTransportError::StreamIoError("websocket error".to_string())),
            }
        }
    }

    async fn close(&mut self, payload: Option<Vec<u8>>) {
        if let Some(payload) = payload {
            let _ = self.stream.send(WsMessage::Binary(payload.into())).await;
        }
        let _ = self.stream.close(None).await;
    }
}

fn classify_connect_error(err: &tokio_tungstenite::tungstenite::Error) -> RawTransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(_) => RawTransportError::ConnectFailed,
        WsError::Tls(_) => RawTransportError::Tls(crate::error::TlsErrorKind::Unknown),
        WsError::ConnectionClosed | WsError::AlreadyClosed => RawTransportError::StreamClosed,
        _ => RawTransportError::ConnectRefused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_transport_replies_to_a_client_hello() {
        let mut transport = OfflineTransport::connect();
        let hello = protocol::ClientMessage::ClientHello(protocol::VersionInfo {
            game_magic: offline_backend::GAME_MAGIC,
            version: "1.0.0".to_string(),
            build_number: 1,
            client_logic_version: 1,
            full_protocol_hash: offline_backend::PROTOCOL_HASH,
            commit_id: "offline".to_string(),
            client_session_connection_index: 0,
            client_session_nonce: uuid::Uuid::new_v4(),
            app_launch_id: uuid::Uuid::new_v4(),
            platform: "test".to_string(),
            login_protocol_version: 1,
        });
        transport
            .send_binary(postcard::to_stdvec(&hello).unwrap())
            .await
            .unwrap();
        let reply = transport.recv_binary().await.unwrap();
        assert!(reply.is_some());
    }
}
