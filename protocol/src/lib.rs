//! Wire message contracts for the session supervisor.
//!
//! This crate only carries *payload shapes*, it does not define how they are
//! framed on the wire (length-prefixing, compression, ...) — that is left to
//! whatever [`Transport`](../session_supervisor/trait.Transport.html)
//! implementation a deployment picks. Both `session-supervisor` and
//! `offline-backend` depend on this crate so that a simulated and a real
//! backend agree on the same payload types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Version and build identification sent in `ClientHello`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    /// Fixed magic identifying this as a client of the game, not a stray connection.
    pub game_magic: u32,
    /// Human readable client version (e.g. `"1.4.2"`).
    pub version: String,
    /// Monotonically increasing build number.
    pub build_number: u32,
    /// Logic version the client's game-state model was compiled against.
    pub client_logic_version: u32,
    /// Hash of the full wire protocol shape, used to detect drift server-side.
    pub full_protocol_hash: u64,
    /// Commit id of the client build, checked against the server's expectation.
    pub commit_id: String,
    /// Index of this connection attempt within the logical client session.
    pub client_session_connection_index: u32,
    /// Per-process nonce distinguishing concurrent connections from the same client.
    pub client_session_nonce: Uuid,
    /// Stable identifier for this client process launch.
    pub app_launch_id: Uuid,
    /// Platform string (e.g. `"windows"`, `"ios"`, `"android"`).
    pub platform: String,
    /// Version of the login sub-protocol the client speaks.
    pub login_protocol_version: u32,
}

/// Server-reported options handed back on `ClientHelloAccepted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerOptions {
    /// Free-form key/value settings the server wants the client to honor
    /// (feature flags, rate limits, ...). Opaque to the supervisor.
    pub settings: BTreeMap<String, String>,
}

/// Opaque login method payload. The concrete authentication scheme (guest,
/// social, ...) lives entirely outside this crate; the supervisor only needs
/// to carry *some* serializable claim across the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LoginRequest {
    /// Ask the server to mint a brand-new guest account.
    NewGuestAccount,
    /// Log in with an existing guest account.
    GuestAccount {
        device_id: String,
        auth_token: String,
        player_id_hint: Option<String>,
    },
    /// Log in via a third-party social identity claim. The claim bytes are
    /// opaque to the supervisor — validated entirely server-side.
    SocialAuth {
        claim: Vec<u8>,
        player_id_hint: Option<String>,
    },
}

/// One archive slot's proposed/corrected version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotId(pub String);

/// The client's best guess of resource versions, presented at session start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceProposal {
    /// Per-slot archive id the client currently holds.
    pub slots: BTreeMap<SlotId, ArchiveId>,
    /// Active language, if one has been resolved yet.
    pub language: Option<String>,
    /// Client-observed logic version.
    pub version: u32,
}

/// Content-addressed archive identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveId(pub String);

/// One slot's correction: a new archive, optional patch, optional URL suffix
/// used for cache-busting / CDN routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotCorrection {
    pub archive: ArchiveId,
    pub patch: Option<ArchiveId>,
    pub url_suffix: Option<String>,
}

/// Server-issued delta instructing the client which archive versions to fetch
/// before session start can proceed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceCorrection {
    pub slots: BTreeMap<SlotId, SlotCorrection>,
    pub language: Option<String>,
    pub version: Option<u32>,
}

/// A scheduled or ongoing maintenance window, in UTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceWindow {
    /// RFC 3339 / ISO-8601 UTC timestamp string for the start of the window.
    pub start_at: String,
    /// RFC 3339 / ISO-8601 UTC timestamp string for the estimated end, if known.
    pub estimated_end_time: Option<String>,
}

/// One active A/B experiment assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExperimentAssignment {
    pub experiment_id: String,
    pub variant_id: String,
}

/// Client -> Server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientMessage {
    ClientHello(VersionInfo),
    LoginRequest(LoginRequest),
    CreateGuestAccountRequest,
    SessionStartRequest {
        query_id: u32,
        resource_proposal: ResourceProposal,
        time_zone_info: String,
    },
    SessionPing {
        id: u32,
    },
    AbortSessionStart {
        trailer: Option<Vec<u8>>,
    },
    ClientLifecycleHintPausing {
        max_duration_millis: Option<u64>,
        reason: Option<String>,
    },
    ClientLifecycleHintUnpausing,
    ClientLifecycleHintUnpaused,
}

/// Server -> Client message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerMessage {
    ClientHelloAccepted {
        server_options: ServerOptions,
    },
    LoginSuccessResponse {
        logged_in_player_id: String,
    },
    CreateGuestAccountResponse {
        device_id: String,
        auth_token: String,
        player_id: String,
    },
    SessionStartSuccess {
        query_id: u32,
        session_token: String,
        player_id: String,
        player_state: Vec<u8>,
        entity_states: Vec<Vec<u8>>,
        localization_versions: BTreeMap<String, u32>,
        active_experiments: Vec<ExperimentAssignment>,
        scheduled_maintenance_mode: Option<MaintenanceWindow>,
        resumption_token: String,
    },
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
    ConnectionHandshakeFailure {
        reason: String,
    },
    OperationStillOngoing,
    ConnectedToServer {
        is_ipv4: bool,
        tls_peer_description: Option<String>,
    },
}

/// The join/resume envelope sent as the very first frame on a fresh
/// transport, before `ClientHello`. Analogous to the teacher's `JoinRequest`,
/// generalized to carry an optional resumption token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportGreeting {
    pub resumption_token: Option<String>,
}
