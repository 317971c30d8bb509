//! Error taxonomy (C10) and the deterministic Error Translator.
//!
//! The teacher represents every failure as a `String` — adequate for a
//! single flat `mark_error` call, not for the branching retry/terminal
//! policy this spec needs. Per the design notes (§9 "tagged errors over
//! inheritance") this becomes a flat `thiserror` sum type instead of the
//! source's `ConnectionState -> ErrorState -> TerminalError/TransientError`
//! class hierarchy; the `IHasNetworkDiagnosticReport` marker becomes a plain
//! `Option<NetworkDiagnosticReport>` carried alongside the error by whichever
//! `ConnectionState` variant needs it (see `supervisor::ConnectionState`).

use protocol::MaintenanceWindow;
use thiserror::Error;

/// Where a timeout occurred, distinguishing the three timeout sources spec
/// §7 calls out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    Connect,
    Stream,
    ResourceFetch,
}

/// The four TLS failure kinds spec §7 enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    NotAuthenticated,
    FailureWhileAuthenticating,
    NotEncrypted,
    Unknown,
}

/// Whether a config fetch failed during the network fetch itself or during
/// the client-side `activate()`/`specialize()` step afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFetchSource {
    ResourceFetch,
    Activation,
}

/// The four session-protocol violation kinds spec §7 enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProtocolErrorKind {
    UnexpectedLoginMessage,
    MissingServerHello,
    SessionStartFailed,
    SessionProtocolError,
}

/// Raw failures as surfaced by [`crate::connection::ServerConnection`],
/// before classification. Deliberately separate from [`ConnectionError`] so
/// the translation step (this module's whole job) stays a pure function from
/// one to the other, with no hidden state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTransportError {
    InvalidMagic,
    WireProtocolVersionMismatch,
    ClusterStarting,
    ClusterShuttingDown,
    InMaintenance(MaintenanceWindow),
    WireFormatError,
    ConnectFailed,
    ConnectRefused,
    Tls(TlsErrorKind),
    StreamClosed,
    StreamIoError(String),
    StreamTimeout(TimeoutSource),
    UnexpectedLoginMessage,
    MissingServerHello,
    LogicVersionMismatch { server_downgrade: bool },
    LoginProtocolVersionMismatch,
    CommitIdMismatch,
    SessionResumeFailed,
    SessionStartFailed,
    SessionProtocolViolation,
    SessionForceTerminated { reason: String },
    PlayerIsBanned,
    PlayerDeserializationFailed,
    WatchdogDeadlineExceeded,
    EnqueuedClose(Vec<u8>),
    ConfigFetchFailed(ConfigFetchSource),
}

/// The flat classified error taxonomy of spec §7. `Transient` means retry is
/// likely to help; `Terminal` means it will not.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    // --- Transient ---
    #[error("transport closed")]
    TransportClosed,
    #[error("transport timeout ({0:?})")]
    TransportTimeout(TimeoutSource),
    #[error("tls error ({0:?})")]
    TlsError(TlsErrorKind),
    #[error("cluster not ready (starting = {starting})")]
    ClusterNotReady { starting: bool },
    #[error("config fetch failed ({0:?})")]
    ConfigFetchFailed(ConfigFetchSource),
    #[error("failed to resume session")]
    SessionResumeFailed,
    #[error("session force-terminated: {reason}")]
    SessionForceTerminated { reason: String },
    #[error("session protocol error ({0:?})")]
    SessionProtocolError(SessionProtocolErrorKind),
    #[error("session lost while backgrounded")]
    SessionLostInBackground,
    #[error("app suspended too long")]
    AppTooLongSuspended,
    #[error("internal watchdog deadline exceeded")]
    WatchdogDeadlineExceeded,

    // --- Terminal ---
    #[error("wire protocol version mismatch")]
    WireProtocolVersionMismatch,
    #[error("invalid game magic")]
    InvalidGameMagic,
    #[error("in maintenance")]
    InMaintenance(MaintenanceWindow),
    #[error("logic version mismatch (downgrade = {downgrade})")]
    LogicVersionMismatch { downgrade: bool },
    #[error("login protocol version mismatch")]
    LoginProtocolVersionMismatch,
    #[error("commit id mismatch")]
    CommitIdMismatch,
    #[error("wire format error")]
    WireFormatError,
    #[error("no network connectivity")]
    NoNetworkConnectivity,
    #[error("player is banned")]
    PlayerIsBanned,
    #[error("player deserialization failed on server")]
    PlayerDeserializationFailed,
    #[error("client-side connection error: {0}")]
    ClientSideConnectionError(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ConnectionError {
    /// Whether retrying the connection is expected to help at all. Mirrors
    /// the Transient/Terminal split that drives the supervisor's attempt
    /// budget (spec §4.1).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::TransportClosed
                | ConnectionError::TransportTimeout(_)
                | ConnectionError::TlsError(_)
                | ConnectionError::ClusterNotReady { .. }
                | ConnectionError::ConfigFetchFailed(_)
                | ConnectionError::SessionResumeFailed
                | ConnectionError::SessionForceTerminated { .. }
                | ConnectionError::SessionProtocolError(_)
                | ConnectionError::SessionLostInBackground
                | ConnectionError::AppTooLongSuspended
                | ConnectionError::WatchdogDeadlineExceeded
        )
    }
}

/// Deterministic pure function from a raw transport error to a classified
/// [`ConnectionError`] (C10, first half). The post-classification pass
/// (background masking, no-network override, maintenance upgrade) is kept
/// separate in [`crate::supervisor`] since it needs supervisor-local
/// context (pause history, probe state, status hint) that this function
/// must not see, to keep this step pure and independently testable.
pub fn translate(raw: RawTransportError) -> ConnectionError {
    match raw {
        RawTransportError::InvalidMagic => ConnectionError::InvalidGameMagic,
        RawTransportError::WireProtocolVersionMismatch => {
            ConnectionError::WireProtocolVersionMismatch
        }
        RawTransportError::ClusterStarting => ConnectionError::ClusterNotReady { starting: true },
        RawTransportError::ClusterShuttingDown => {
            ConnectionError::ClusterNotReady { starting: false }
        }
        RawTransportError::InMaintenance(window) => ConnectionError::InMaintenance(window),
        RawTransportError::WireFormatError => ConnectionError::WireFormatError,
        RawTransportError::ConnectFailed | RawTransportError::ConnectRefused => {
            ConnectionError::TransportClosed
        }
        RawTransportError::Tls(kind) => ConnectionError::TlsError(kind),
        RawTransportError::StreamClosed => ConnectionError::TransportClosed,
        RawTransportError::StreamIoError(_) => ConnectionError::TransportClosed,
        RawTransportError::StreamTimeout(source) => ConnectionError::TransportTimeout(source),
        RawTransportError::UnexpectedLoginMessage => ConnectionError::SessionProtocolError(
            SessionProtocolErrorKind::UnexpectedLoginMessage,
        ),
        RawTransportError::MissingServerHello => {
            ConnectionError::SessionProtocolError(SessionProtocolErrorKind::MissingServerHello)
        }
        RawTransportError::LogicVersionMismatch { server_downgrade } => {
            ConnectionError::LogicVersionMismatch {
                downgrade: server_downgrade,
            }
        }
        RawTransportError::LoginProtocolVersionMismatch => {
            ConnectionError::LoginProtocolVersionMismatch
        }
        RawTransportError::CommitIdMismatch => ConnectionError::CommitIdMismatch,
        RawTransportError::SessionResumeFailed => ConnectionError::SessionResumeFailed,
        RawTransportError::SessionStartFailed => {
            ConnectionError::SessionProtocolError(SessionProtocolErrorKind::SessionStartFailed)
        }
        RawTransportError::SessionProtocolViolation => {
            ConnectionError::SessionProtocolError(SessionProtocolErrorKind::SessionProtocolError)
        }
        RawTransportError::SessionForceTerminated { reason } => {
            ConnectionError::SessionForceTerminated { reason }
        }
        RawTransportError::PlayerIsBanned => ConnectionError::PlayerIsBanned,
        RawTransportError::PlayerDeserializationFailed => {
            ConnectionError::PlayerDeserializationFailed
        }
        RawTransportError::WatchdogDeadlineExceeded => ConnectionError::WatchdogDeadlineExceeded,
        RawTransportError::EnqueuedClose(payload) => {
            // The pause-retention marker payload is recognized one layer up
            // (supervisor, which is the only place that knows which payload
            // it itself attached to the close call); any other opaque
            // payload here is just a generic drop.
            if payload == crate::supervisor::PAUSE_CLOSE_MARKER {
                ConnectionError::SessionLostInBackground
            } else {
                ConnectionError::TransportClosed
            }
        }
        RawTransportError::ConfigFetchFailed(source) => ConnectionError::ConfigFetchFailed(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_are_transient_transport_closed() {
        assert_eq!(
            translate(RawTransportError::ConnectFailed),
            ConnectionError::TransportClosed
        );
        assert!(translate(RawTransportError::ConnectFailed).is_transient());
    }

    #[test]
    fn invalid_magic_is_terminal() {
        let err = translate(RawTransportError::InvalidMagic);
        assert_eq!(err, ConnectionError::InvalidGameMagic);
        assert!(!err.is_transient());
    }

    #[test]
    fn maintenance_window_is_carried_through() {
        let window = MaintenanceWindow {
            start_at: "2024-01-01T00:00:00Z".to_string(),
            estimated_end_time: Some("2024-01-01T01:00:00Z".to_string()),
        };
        let err = translate(RawTransportError::InMaintenance(window.clone()));
        assert_eq!(err, ConnectionError::InMaintenance(window));
    }

    #[test]
    fn pause_marker_close_is_reclassified_as_lost_in_background() {
        let raw = RawTransportError::EnqueuedClose(crate::supervisor::PAUSE_CLOSE_MARKER.to_vec());
        assert_eq!(translate(raw), ConnectionError::SessionLostInBackground);
    }

    #[test]
    fn unrelated_enqueued_close_is_generic_transport_closed() {
        let raw = RawTransportError::EnqueuedClose(b"some-other-payload".to_vec());
        assert_eq!(translate(raw), ConnectionError::TransportClosed);
    }
}
