//! Session supervisor library: a long-lived state machine that establishes,
//! maintains, recovers, and terminates a player's interactive session with a
//! backend game server.
//!
//! [`supervisor::SessionSupervisor`] is the entry point; everything else is a
//! collaborator it owns or calls through a trait boundary.

pub mod blob;
pub mod clock;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod device_guid;
pub mod error;
pub mod incident;
pub mod logs;
pub mod murmur2;
pub mod probe;
pub mod qos;
pub mod resources;
pub mod status_hint;
pub mod supervisor;
pub mod transport;

pub use config::{Endpoint, SupervisorConfig};
pub use error::ConnectionError;
pub use supervisor::{ConnectionState, MaintenanceMode, SessionSupervisor, SupervisorEvent};
