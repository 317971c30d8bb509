//! Credential service (C3): opaque, async load/select/update of login method.
//!
//! The concrete storage backend (platform keychain, flat file, ...) and the
//! authentication scheme itself are external collaborators per spec §1; this
//! module only defines the trait boundary the supervisor calls through, plus
//! the one persistence format spec §6 *does* pin down precisely: the
//! credentials blob envelope (see [`crate::blob`]).

use async_trait::async_trait;
use protocol::LoginRequest;

/// Guest credentials as owned by the credential service once a guest account
/// has been created or loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCredentials {
    pub device_id: String,
    pub auth_token: String,
    pub player_id: String,
}

/// The method the supervisor should use for the next login attempt.
///
/// Resolved afresh at every reconnect (Invariant 5, spec §3) — this is why
/// [`CredentialService::current_login_method`] is async and re-queried
/// rather than cached by the supervisor across attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMethod {
    NewGuestAccount,
    GuestAccount {
        device_id: String,
        auth_token: String,
        player_id_hint: Option<String>,
    },
    SocialAuth {
        claim: Vec<u8>,
        player_id_hint: Option<String>,
    },
}

impl From<LoginMethod> for LoginRequest {
    fn from(method: LoginMethod) -> Self {
        match method {
            LoginMethod::NewGuestAccount => LoginRequest::NewGuestAccount,
            LoginMethod::GuestAccount {
                device_id,
                auth_token,
                player_id_hint,
            } => LoginRequest::GuestAccount {
                device_id,
                auth_token,
                player_id_hint,
            },
            LoginMethod::SocialAuth {
                claim,
                player_id_hint,
            } => LoginRequest::SocialAuth {
                claim,
                player_id_hint,
            },
        }
    }
}

/// The contract the supervisor consumes for credential management.
///
/// Implementations own whatever storage and auth plumbing they need; the
/// supervisor never inspects credentials beyond what this trait returns.
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Called once before any login is attempted (Invariant 5).
    async fn initialize(&self) -> Result<(), String>;

    /// Resolves which login method to use for the *next* attempt. Called
    /// fresh at every reconnect, never cached by the caller.
    async fn current_login_method(&self) -> Result<LoginMethod, String>;

    /// Persists newly minted guest credentials after a successful
    /// `CreateGuestAccountResponse`. A failure here is routed by the
    /// supervisor to `ClientSideConnectionError` (spec §7).
    async fn store_guest_credentials(&self, credentials: GuestCredentials) -> Result<(), String>;
}

/// An in-memory credential service for tests and the offline mode, backed by
/// a fixed [`LoginMethod`] supplied at construction.
pub struct StaticCredentialService {
    method: LoginMethod,
}

impl StaticCredentialService {
    pub fn new(method: LoginMethod) -> Self {
        Self { method }
    }
}

#[async_trait]
impl CredentialService for StaticCredentialService {
    async fn initialize(&self) -> Result<(), String> {
        Ok(())
    }

    async fn current_login_method(&self) -> Result<LoginMethod, String> {
        Ok(self.method.clone())
    }

    async fn store_guest_credentials(&self, _credentials: GuestCredentials) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_service_returns_configured_method() {
        let service = StaticCredentialService::new(LoginMethod::NewGuestAccount);
        service.initialize().await.unwrap();
        assert_eq!(
            service.current_login_method().await.unwrap(),
            LoginMethod::NewGuestAccount
        );
    }
}
