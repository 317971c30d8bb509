//! ServerConnection: the framed protocol on top of a raw [`Transport`],
//! per-phase timeouts, and the coarse connection controls (`retrySessionStart`,
//! `abortSessionStart`, `resumeSessionAfterConnectionDrop`,
//! `abortSessionAfterConnectionDrop`, `enqueueSendMessage`, `enqueueClose`,
//! `enqueueTransportWriteFence`). Messages are whole-value `postcard`
//! encoded/decoded, since each wire message is itself a tagged enum.
//!
//! The internal watchdog that detects worker stalls is modeled here as a
//! `tokio::time::timeout` wrapped around every blocking receive rather than a
//! separately spawned I/O task: the supervisor's step loop already treats
//! every `ServerConnection` call as a suspension point, so a stalled
//! transport read surfaces identically either way — as a
//! `WatchdogDeadlineExceeded` once the deadline passes.

use crate::config::Endpoint;
use crate::error::{RawTransportError, TimeoutSource};
use crate::transport::{self, Transport};
use protocol::{
    ClientMessage, ExperimentAssignment, LoginRequest, MaintenanceWindow, ResourceCorrection,
    ResourceProposal, ServerMessage, ServerOptions, VersionInfo,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Fields carried by a successful `SessionStartSuccess`, collected into one
/// struct so supervisor code doesn't have to destructure the wire enum.
#[derive(Debug, Clone)]
pub struct SessionStartInfo {
    pub query_id: u32,
    pub session_token: String,
    pub player_id: String,
    pub player_state: Vec<u8>,
    pub entity_states: Vec<Vec<u8>>,
    pub localization_versions: BTreeMap<String, u32>,
    pub active_experiments: Vec<ExperimentAssignment>,
    pub scheduled_maintenance_mode: Option<MaintenanceWindow>,
    pub resumption_token: String,
}

/// Every event the connection can surface to the supervisor: the real server
/// messages plus transport-info pseudo-messages (`GotServerHello`,
/// `GuestAccountCreatedInfo`, `ResourceCorrectionInfo`, `SessionStartRequested`)
/// folded into the same enum rather than kept separate, since the supervisor
/// consumes them from a single receive queue either way.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    GotServerHello {
        is_ipv4: bool,
        tls_peer_description: Option<String>,
    },
    ClientHelloAccepted(ServerOptions),
    LoginSuccess {
        logged_in_player_id: String,
    },
    GuestAccountCreated {
        device_id: String,
        auth_token: String,
        player_id: String,
    },
    SessionStartSuccess(SessionStartInfo),
    SessionStartFailure {
        query_id: u32,
        reason_code: String,
    },
    SessionStartResourceCorrection {
        query_id: u32,
        resource_correction: ResourceCorrection,
    },
    SessionResumeSuccess {
        scheduled_maintenance_mode: Option<MaintenanceWindow>,
    },
    SessionPong {
        id: u32,
    },
    UpdateScheduledMaintenanceMode {
        scheduled: Option<MaintenanceWindow>,
    },
    OperationStillOngoing,
}

/// Owns one attempt's transport end to end. Dropped on any exit from the
/// attempt — there is
/// deliberately no reconnect-in-place method; a fresh `ServerConnection` is
/// constructed per attempt by the supervisor.
pub struct ServerConnection {
    transport: Box<dyn Transport>,
}

impl ServerConnection {
    /// Establishes the transport for `endpoint`. Does not perform any
    /// protocol-level handshake yet — callers drive that via
    /// [`Self::send_client_hello`] and [`Self::next_event`].
    pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self, RawTransportError> {
        let transport = transport::connect(endpoint, connect_timeout).await?;
        Ok(Self { transport })
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), RawTransportError> {
        let bytes = postcard::to_stdvec(message).map_err(|_| RawTransportError::WireFormatError)?;
        self.transport.send_binary(bytes).await
    }

    pub async fn send_client_hello(&mut self, info: VersionInfo) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::ClientHello(info)).await
    }

    pub async fn send_login(&mut self, login: LoginRequest) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::LoginRequest(login)).await
    }

    pub async fn send_create_guest_account_request(&mut self) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::CreateGuestAccountRequest).await
    }

    /// Sends a `SessionStartRequest`. Also used to implement a session-start
    /// retry: a retry is simply the same request with a fresh proposal and the
    /// same or a bumped `query_id`.
    pub async fn send_session_start_request(
        &mut self,
        query_id: u32,
        resource_proposal: ResourceProposal,
        time_zone_info: String,
    ) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::SessionStartRequest {
            query_id,
            resource_proposal,
            time_zone_info,
        })
        .await
    }

    pub async fn abort_session_start(&mut self, trailer: Option<Vec<u8>>) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::AbortSessionStart { trailer }).await
    }

    pub async fn send_ping(&mut self, id: u32) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::SessionPing { id }).await
    }

    pub async fn send_lifecycle_hint_pausing(
        &mut self,
        max_duration_millis: Option<u64>,
        reason: Option<String>,
    ) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::ClientLifecycleHintPausing {
            max_duration_millis,
            reason,
        })
        .await
    }

    pub async fn send_lifecycle_hint_unpausing(&mut self) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::ClientLifecycleHintUnpausing).await
    }

    pub async fn send_lifecycle_hint_unpaused(&mut self) -> Result<(), RawTransportError> {
        self.send(&ClientMessage::ClientLifecycleHintUnpaused).await
    }

    /// Generic outbound enqueue for application-level messages once a
    /// session is established.
    pub async fn enqueue_send_message(&mut self, message: ClientMessage) -> Result<(), RawTransportError> {
        self.send(&message).await
    }

    /// Forces a flush of anything buffered by the transport. Implemented as
    /// a zero-length frame: both transport implementations flush on every
    /// `send_binary` call, so this is enough of a fence for
    /// `closeFlushTimeout` waits to be meaningful.
    pub async fn enqueue_transport_write_fence(&mut self) -> Result<(), RawTransportError> {
        self.transport.send_binary(Vec::new()).await
    }

    /// Closes the transport, optionally attaching `payload` as the
    /// pause-termination marker so the resulting read error can be
    /// reclassified by [`crate::error::translate`].
    pub async fn enqueue_close(&mut self, payload: Option<Vec<u8>>) {
        self.transport.close(payload).await;
    }

    /// Re-establishes a transport against `endpoint` carrying `resumption_token`
    /// as the very first frame, then awaits a `SessionResumeSuccess` within
    /// `deadline`.
    pub async fn resume_session_after_connection_drop(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        resumption_token: String,
        deadline: Duration,
    ) -> Result<(Self, ConnectionEvent), RawTransportError> {
        let mut connection = Self::connect(endpoint, connect_timeout).await?;
        let greeting = protocol::TransportGreeting {
            resumption_token: Some(resumption_token),
        };
        let bytes = postcard::to_stdvec(&greeting).map_err(|_| RawTransportError::WireFormatError)?;
        connection.transport.send_binary(bytes).await?;

        loop {
            match connection.next_event(deadline).await? {
                event @ ConnectionEvent::SessionResumeSuccess { .. } => return Ok((connection, event)),
                ConnectionEvent::GotServerHello { .. } => continue,
                _ => return Err(RawTransportError::SessionResumeFailed),
            }
        }
    }

    /// Gives up on resuming: tears the transport down without attempting
    /// any further protocol exchange.
    pub async fn abort_session_after_connection_drop(&mut self) {
        self.transport.close(None).await;
    }

    /// Waits for, decodes, and classifies the next inbound frame. A timeout
    /// here is the watchdog firing.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<ConnectionEvent, RawTransportError> {
        let frame = tokio::time::timeout(timeout, self.transport.recv_binary())
            .await
            .map_err(|_| RawTransportError::WatchdogDeadlineExceeded)??;

        let Some(bytes) = frame else {
            return Err(RawTransportError::StreamClosed);
        };
        if bytes.is_empty() {
            // Our own write-fence marker looped back (offline mode only); not a protocol event.
            return Box::pin(self.next_event(timeout)).await;
        }

        let message: ServerMessage =
            postcard::from_bytes(&bytes).map_err(|_| RawTransportError::WireFormatError)?;

        if let ServerMessage::ConnectionHandshakeFailure { reason } = &message {
            return Err(classify_handshake_failure(reason));
        }

        Ok(translate_server_message(message))
    }
}

fn translate_server_message(message: ServerMessage) -> ConnectionEvent {
    match message {
        ServerMessage::ConnectedToServer {
            is_ipv4,
            tls_peer_description,
        } => ConnectionEvent::GotServerHello {
            is_ipv4,
            tls_peer_description,
        },
        ServerMessage::ClientHelloAccepted { server_options } => {
            ConnectionEvent::ClientHelloAccepted(server_options)
        }
        ServerMessage::LoginSuccessResponse { logged_in_player_id } => {
            ConnectionEvent::LoginSuccess { logged_in_player_id }
        }
        ServerMessage::CreateGuestAccountResponse {
            device_id,
            auth_token,
            player_id,
        } => ConnectionEvent::GuestAccountCreated {
            device_id,
            auth_token,
            player_id,
        },
        ServerMessage::SessionStartSuccess {
            query_id,
            session_token,
            player_id,
            player_state,
            entity_states,
            localization_versions,
            active_experiments,
            scheduled_maintenance_mode,
            resumption_token,
        } => ConnectionEvent::SessionStartSuccess(SessionStartInfo {
            query_id,
            session_token,
            player_id,
            player_state,
            entity_states,
            localization_versions,
            active_experiments,
            scheduled_maintenance_mode,
            resumption_token,
        }),
        ServerMessage::SessionStartFailure { query_id, reason_code } => {
            ConnectionEvent::SessionStartFailure { query_id, reason_code }
        }
        ServerMessage::SessionStartResourceCorrection {
            query_id,
            resource_correction,
        } => ConnectionEvent::SessionStartResourceCorrection {
            query_id,
            resource_correction,
        },
        ServerMessage::SessionResumeSuccess {
            scheduled_maintenance_mode,
        } => ConnectionEvent::SessionResumeSuccess {
            scheduled_maintenance_mode,
        },
        ServerMessage::SessionPong { id } => ConnectionEvent::SessionPong { id },
        ServerMessage::UpdateScheduledMaintenanceMode { scheduled } => {
            ConnectionEvent::UpdateScheduledMaintenanceMode { scheduled }
        }
        ServerMessage::ConnectionHandshakeFailure { .. } => {
            unreachable!("ConnectionHandshakeFailure is intercepted in ServerConnection::next_event")
        }
        ServerMessage::OperationStillOngoing => ConnectionEvent::OperationStillOngoing,
    }
}

/// Classifies a `ConnectionHandshakeFailure.reason` string into a
/// [`RawTransportError`]. The wire reason codes are a small fixed
/// vocabulary the server and client agree on out of band (not itself part
/// of this crate's scope); unrecognized reasons degrade to
/// `ClientSideConnectionError`-worthy generic closure rather than a panic.
pub fn classify_handshake_failure(reason: &str) -> RawTransportError {
    match reason {
        "invalid_magic" => RawTransportError::InvalidMagic,
        "wire_protocol_mismatch" => RawTransportError::WireProtocolVersionMismatch,
        "cluster_starting" => RawTransportError::ClusterStarting,
        "cluster_shutting_down" => RawTransportError::ClusterShuttingDown,
        "logic_version_mismatch" => RawTransportError::LogicVersionMismatch { server_downgrade: false },
        "logic_version_downgrade" => RawTransportError::LogicVersionMismatch { server_downgrade: true },
        "login_protocol_version_mismatch" => RawTransportError::LoginProtocolVersionMismatch,
        "commit_id_mismatch" => RawTransportError::CommitIdMismatch,
        "player_is_banned" => RawTransportError::PlayerIsBanned,
        "player_deserialization_failed" => RawTransportError::PlayerDeserializationFailed,
        "unexpected_login_message" => RawTransportError::UnexpectedLoginMessage,
        "missing_server_hello" => RawTransportError::MissingServerHello,
        other if other.starts_with("session_force_terminated:") => {
            RawTransportError::SessionForceTerminated {
                reason: other.trim_start_matches("session_force_terminated:").to_string(),
            }
        }
        _ => RawTransportError::StreamIoError(format!("unrecognized handshake failure: {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    fn version_info() -> VersionInfo {
        VersionInfo {
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
        }
    }

    #[tokio::test]
    async fn offline_handshake_reaches_session_start_success() {
        let endpoint = Endpoint::offline();
        let mut connection = ServerConnection::connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        let hello = connection.next_event(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(hello, ConnectionEvent::GotServerHello { .. }));

        connection.send_client_hello(version_info()).await.unwrap();
        let accepted = connection.next_event(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(accepted, ConnectionEvent::ClientHelloAccepted(_)));

        connection
            .send_login(LoginRequest::NewGuestAccount)
            .await
            .unwrap();
        let login = connection.next_event(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(login, ConnectionEvent::LoginSuccess { .. }));

        connection
            .send_session_start_request(1, ResourceProposal::default(), "UTC".to_string())
            .await
            .unwrap();
        let started = connection.next_event(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            started,
            ConnectionEvent::SessionStartSuccess(SessionStartInfo { query_id: 1, .. })
        ));
    }

    #[test]
    fn classifies_known_handshake_failure_reasons() {
        assert!(matches!(
            classify_handshake_failure("invalid_magic"),
            RawTransportError::InvalidMagic
        ));
        assert!(matches!(
            classify_handshake_failure("logic_version_downgrade"),
            RawTransportError::LogicVersionMismatch { server_downgrade: true }
        ));
    }

    #[test]
    fn unrecognized_reason_degrades_to_stream_io_error() {
        assert!(matches!(
            classify_handshake_failure("something_new"),
            RawTransportError::StreamIoError(_)
        ));
    }
}
