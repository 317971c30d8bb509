//! Offline persisted state (spec §6): an opaque tagged serialization of the
//! player model plus per-slot multiplayer entity models, with a schema
//! version used to migrate older saves on load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const OLDEST_SUPPORTED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlayerModel {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EntityModel {
    pub bytes: Vec<u8>,
}

/// Tagged save format: the supervisor's offline mode never inspects the
/// model bytes, only round-trips them across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PersistedState {
    pub schema_version: u32,
    pub player_model: Option<PlayerModel>,
    pub entity_models: BTreeMap<String, EntityModel>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistedStateError {
    #[error("failed to decode persisted state: {0}")]
    Decode(String),
    #[error("schema version {0} is older than the oldest supported version {OLDEST_SUPPORTED_SCHEMA_VERSION}")]
    TooOld(u32),
    #[error("schema version {0} is newer than this build supports ({CURRENT_SCHEMA_VERSION})")]
    TooNew(u32),
}

impl PersistedState {
    pub fn new(player_model: PlayerModel, entity_models: BTreeMap<String, EntityModel>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            player_model: Some(player_model),
            entity_models,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_stdvec(self).expect("PersistedState is always serializable")
    }

    /// Decodes `bytes`, migrating forward if the embedded schema version is
    /// older than current but still within the supported range. There is
    /// only one schema version today, so migration is a no-op; the seam
    /// exists so a future schema bump has somewhere to hook in.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistedStateError> {
        let state: PersistedState =
            postcard::from_bytes(bytes).map_err(|e| PersistedStateError::Decode(e.to_string()))?;
        if state.schema_version < OLDEST_SUPPORTED_SCHEMA_VERSION {
            return Err(PersistedStateError::TooOld(state.schema_version));
        }
        if state.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(PersistedStateError::TooNew(state.schema_version));
        }
        Ok(migrate(state))
    }
}

fn migrate(state: PersistedState) -> PersistedState {
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut entities = BTreeMap::new();
        entities.insert(
            "slot-a".to_string(),
            EntityModel {
                bytes: vec![1, 2, 3],
            },
        );
        let state = PersistedState::new(
            PlayerModel {
                bytes: vec![9, 9, 9],
            },
            entities,
        );
        let bytes = state.to_bytes();
        let decoded = PersistedState::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn rejects_a_schema_version_newer_than_supported() {
        let mut state = PersistedState::default();
        state.schema_version = CURRENT_SCHEMA_VERSION + 1;
        let bytes = state.to_bytes();
        assert!(matches!(
            PersistedState::from_bytes(&bytes),
            Err(PersistedStateError::TooNew(_))
        ));
    }
}
