//! Self-contained simulated backend for offline mode (spec glossary "Offline
//! mode"): a built-in server that speaks the same wire messages as a real
//! cluster, driven entirely through in-memory channels. Grounded on the
//! teacher's `processing_module::handle_server_logic`, which spawns a
//! send/receive task pair over `tokio::sync::mpsc`/`broadcast` channels and
//! races them with `tokio::select!`; generalized here from "relay bytes
//! between two real sockets" to "run a tiny scripted protocol responder" —
//! no gameplay logic, just enough of the handshake/session-start/resume
//! surface for [`Session`] to stand in for [`session-supervisor`]'s
//! `Endpoint::offline()` path.

mod persisted;

pub use persisted::{EntityModel, PersistedState, PlayerModel};

use protocol::{ClientMessage, ServerMessage, ServerOptions};
use tokio::sync::mpsc;

/// Fixed magic and protocol hash both sides of the offline loopback agree on
/// ahead of time — there is no real negotiation risk since both ends are
/// compiled from the same crate.
pub const GAME_MAGIC: u32 = 0x4741_4d45;
pub const PROTOCOL_HASH: u64 = 0x0FF1_11E5_0001;

/// One end of an in-process client/server pair. Spawns the simulated
/// backend as a background task on construction; dropping the `Session`
/// drops the channel senders, which ends the backend task's receive loop.
pub struct Session {
    to_server: mpsc::UnboundedSender<Vec<u8>>,
    from_server: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Session {
    /// Spawns a fresh simulated backend and connects to it, seeded from
    /// `persisted` if this is a resumed offline session.
    pub fn spawn() -> Self {
        Self::spawn_with_state(PersistedState::default())
    }

    pub fn spawn_with_state(persisted: PersistedState) -> Self {
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (from_server_tx, from_server_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_backend(to_server_rx, from_server_tx, persisted));

        Self {
            to_server: to_server_tx,
            from_server: from_server_rx,
        }
    }

    pub fn send(&self, data: Vec<u8>) -> Result<(), ()> {
        self.to_server.send(data).map_err(|_| ())
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_server.recv().await
    }

    /// Ends the session from the client side. Dropping the sender is enough
    /// to make the backend task's loop observe end-of-stream and exit.
    pub fn close(&mut self) {
        let (dummy, _) = mpsc::unbounded_channel();
        self.to_server = dummy;
    }
}

struct BackendState {
    query_id: u32,
    logged_in_player_id: Option<String>,
    resumption_token: Option<String>,
}

async fn run_backend(
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    persisted: PersistedState,
) {
    let mut state = BackendState {
        query_id: 0,
        logged_in_player_id: None,
        resumption_token: persisted.player_model.map(|_| uuid::Uuid::new_v4().to_string()),
    };

    let hello = ServerMessage::ConnectedToServer {
        is_ipv4: true,
        tls_peer_description: None,
    };
    if send_message(&outbound, &hello).is_err() {
        return;
    }

    // A resumed connection's very first frame is a bare `TransportGreeting`,
    // not a `ClientMessage` (see `ServerConnection::resume_session_after_connection_drop`).
    // Only the first frame is checked for this: every offline `Session` is a
    // brand-new backend task with no continuity from whatever connection it
    // is replacing, so there is no real resumption token to validate against
    // — any token is accepted as proof the caller believes it is resuming.
    let mut first_frame = true;

    while let Some(raw) = inbound.recv().await {
        if first_frame {
            first_frame = false;
            if let Ok(greeting) = postcard::from_bytes::<protocol::TransportGreeting>(&raw) {
                if greeting.resumption_token.is_some() {
                    let resume = ServerMessage::SessionResumeSuccess {
                        scheduled_maintenance_mode: None,
                    };
                    if send_message(&outbound, &resume).is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let Ok(message) = postcard::from_bytes::<ClientMessage>(&raw) else {
            tracing::warn!("offline backend received an undecodable frame, ignoring");
            continue;
        };

        let responses = handle_client_message(&mut state, message);
        for response in responses {
            if send_message(&outbound, &response).is_err() {
                return;
            }
        }
    }
}

fn handle_client_message(state: &mut BackendState, message: ClientMessage) -> Vec<ServerMessage> {
    match message {
        ClientMessage::ClientHello(_info) => vec![ServerMessage::ClientHelloAccepted {
            server_options: ServerOptions::default(),
        }],
        ClientMessage::LoginRequest(_login) => {
            let player_id = uuid::Uuid::new_v4().to_string();
            state.logged_in_player_id = Some(player_id.clone());
            vec![ServerMessage::LoginSuccessResponse {
                logged_in_player_id: player_id,
            }]
        }
        ClientMessage::CreateGuestAccountRequest => {
            let player_id = uuid::Uuid::new_v4().to_string();
            state.logged_in_player_id = Some(player_id.clone());
            vec![ServerMessage::CreateGuestAccountResponse {
                device_id: uuid::Uuid::new_v4().to_string(),
                auth_token: uuid::Uuid::new_v4().to_string(),
                player_id,
            }]
        }
        ClientMessage::SessionStartRequest { query_id, .. } => {
            state.query_id = query_id;
            let resumption_token = state
                .resumption_token
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            state.resumption_token = Some(resumption_token.clone());
            vec![ServerMessage::SessionStartSuccess {
                query_id,
                session_token: uuid::Uuid::new_v4().to_string(),
                player_id: state
                    .logged_in_player_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                player_state: Vec::new(),
                entity_states: Vec::new(),
                localization_versions: Default::default(),
                active_experiments: Vec::new(),
                scheduled_maintenance_mode: None,
                resumption_token,
            }]
        }
        ClientMessage::SessionPing { id } => vec![ServerMessage::SessionPong { id }],
        ClientMessage::AbortSessionStart { .. }
        | ClientMessage::ClientLifecycleHintPausing { .. }
        | ClientMessage::ClientLifecycleHintUnpausing
        | ClientMessage::ClientLifecycleHintUnpaused => Vec::new(),
    }
}

fn send_message(outbound: &mpsc::UnboundedSender<Vec<u8>>, message: &ServerMessage) -> Result<(), ()> {
    let bytes = postcard::to_stdvec(message).map_err(|_| ())?;
    outbound.send(bytes).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::VersionInfo;

    fn client_hello() -> ClientMessage {
        ClientMessage::ClientHello(VersionInfo {
            game_magic: GAME_MAGIC,
            version: "1.0.0".to_string(),
            build_number: 1,
            client_logic_version: 1,
            full_protocol_hash: PROTOCOL_HASH,
            commit_id: "offline".to_string(),
            client_session_connection_index: 0,
            client_session_nonce: uuid::Uuid::new_v4(),
            app_launch_id: uuid::Uuid::new_v4(),
            platform: "test".to_string(),
            login_protocol_version: 1,
        })
    }

    #[tokio::test]
    async fn session_sends_connected_to_server_immediately() {
        let mut session = Session::spawn();
        let first = session.recv().await.unwrap();
        let decoded: ServerMessage = postcard::from_bytes(&first).unwrap();
        assert!(matches!(decoded, ServerMessage::ConnectedToServer { .. }));
    }

    #[tokio::test]
    async fn full_handshake_reaches_session_start_success() {
        let mut session = Session::spawn();
        let _ = session.recv().await.unwrap();

        session
            .send(postcard::to_stdvec(&client_hello()).unwrap())
            .unwrap();
        let accepted: ServerMessage = postcard::from_bytes(&session.recv().await.unwrap()).unwrap();
        assert!(matches!(accepted, ServerMessage::ClientHelloAccepted { .. }));

        session
            .send(postcard::to_stdvec(&ClientMessage::LoginRequest(protocol::LoginRequest::NewGuestAccount)).unwrap())
            .unwrap();
        let login: ServerMessage = postcard::from_bytes(&session.recv().await.unwrap()).unwrap();
        assert!(matches!(login, ServerMessage::LoginSuccessResponse { .. }));

        session
            .send(
                postcard::to_stdvec(&ClientMessage::SessionStartRequest {
                    query_id: 1,
                    resource_proposal: Default::default(),
                    time_zone_info: "UTC".to_string(),
                })
                .unwrap(),
            )
            .unwrap();
        let started: ServerMessage = postcard::from_bytes(&session.recv().await.unwrap()).unwrap();
        assert!(matches!(started, ServerMessage::SessionStartSuccess { query_id: 1, .. }));
    }

    #[tokio::test]
    async fn session_ping_is_answered_with_matching_pong() {
        let mut session = Session::spawn();
        let _ = session.recv().await.unwrap();
        session
            .send(postcard::to_stdvec(&ClientMessage::SessionPing { id: 7 }).unwrap())
            .unwrap();
        let pong: ServerMessage = postcard::from_bytes(&session.recv().await.unwrap()).unwrap();
        assert!(matches!(pong, ServerMessage::SessionPong { id: 7 }));
    }
}
