//! Login flow over the excluded auth collaborators.
//!
//! The core never speaks LDAP or mints real tokens; it talks to a
//! [`DirectoryAuthenticator`] for primary credentials and a [`TokenIssuer`]
//! for the post-verification token pair. [`AuthFlow`] ties them to the
//! two-factor manager: login validates primary credentials and issues a
//! challenge; verify checks the code and returns tokens. Invalid primary
//! credentials never issue a challenge.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::twofactor::{TwoFactorError, TwoFactorManager};

/// Errors from the login flow.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Primary username/password validation failed.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The account exists but is disabled.
    #[error("account '{username}' is inactive")]
    Inactive {
        /// The disabled account.
        username: String,
    },

    /// The authenticated account has no address to deliver a code to.
    #[error("account '{username}' has no email address on file")]
    NoDeliveryAddress {
        /// The account without an address.
        username: String,
    },

    /// Challenge issue/verify failure.
    #[error(transparent)]
    TwoFactor(#[from] TwoFactorError),
}

/// An authenticated staff identity as reported by the directory.
#[derive(Debug, Clone)]
pub struct StaffIdentity {
    /// Username.
    pub username: String,
    /// Email address, used for code delivery.
    pub email: Option<String>,
    /// Whether the account is enabled.
    pub active: bool,
    /// Whether the account carries staff privileges.
    pub staff: bool,
}

/// An opaque access/refresh token pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    /// Access token.
    pub access: String,
    /// Refresh token.
    pub refresh: String,
}

/// Primary-credential validation against the external directory.
pub trait DirectoryAuthenticator: Send + Sync {
    /// Validates a username/password pair. `None` means the pair is invalid;
    /// the caller must not distinguish unknown users from wrong passwords.
    fn authenticate(&self, username: &str, password: &str) -> Option<StaffIdentity>;
}

/// Token minting for verified users.
pub trait TokenIssuer: Send + Sync {
    /// Produces a fresh token pair for the user.
    fn issue(&self, username: &str) -> TokenPair;
}

/// The two-step login flow.
pub struct AuthFlow {
    authenticator: Arc<dyn DirectoryAuthenticator>,
    tokens: Arc<dyn TokenIssuer>,
    twofactor: TwoFactorManager,
}

impl AuthFlow {
    /// Creates a flow over the given collaborators.
    #[must_use]
    pub fn new(
        authenticator: Arc<dyn DirectoryAuthenticator>,
        tokens: Arc<dyn TokenIssuer>,
        twofactor: TwoFactorManager,
    ) -> Self {
        Self {
            authenticator,
            tokens,
            twofactor,
        }
    }

    /// First step: validates primary credentials and issues a two-factor
    /// challenge to the account's email address.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] on a bad pair (no challenge
    /// is issued), [`AuthError::Inactive`] for disabled accounts, and
    /// [`AuthError::NoDeliveryAddress`] when there is nowhere to send the
    /// code.
    pub fn login(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let Some(identity) = self.authenticator.authenticate(username, password) else {
            warn!(username, "primary authentication failed");
            return Err(AuthError::InvalidCredentials);
        };
        if !identity.active {
            return Err(AuthError::Inactive {
                username: identity.username,
            });
        }
        let Some(email) = identity.email.as_deref() else {
            return Err(AuthError::NoDeliveryAddress {
                username: identity.username,
            });
        };
        self.twofactor.issue(&identity.username, email)?;
        info!(username, "primary login accepted, challenge issued");
        Ok(())
    }

    /// Second step: verifies the code and mints the session token pair.
    ///
    /// # Errors
    ///
    /// Propagates [`TwoFactorError::NotFound`] and
    /// [`TwoFactorError::ChallengeExpired`] from verification.
    pub fn verify(&self, username: &str, code: &str) -> Result<TokenPair, AuthError> {
        self.twofactor.verify(username, code)?;
        info!(username, "two-factor verification passed, tokens issued");
        Ok(self.tokens.issue(username))
    }
}

impl std::fmt::Debug for AuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFlow").finish_non_exhaustive()
    }
}

/// A token issuer minting random opaque tokens. Stands in for the excluded
/// JWT collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueTokenIssuer;

impl TokenIssuer for OpaqueTokenIssuer {
    fn issue(&self, _username: &str) -> TokenPair {
        TokenPair {
            access: uuid::Uuid::new_v4().to_string(),
            refresh: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// A fixed-credential authenticator for tests and local runs.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: Vec<(String, String, StaffIdentity)>,
}

impl StaticAuthenticator {
    /// Creates an authenticator with no accounts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account with its password.
    #[must_use]
    pub fn with_user(mut self, password: &str, identity: StaffIdentity) -> Self {
        self.users
            .push((identity.username.clone(), password.to_string(), identity));
        self
    }
}

impl DirectoryAuthenticator for StaticAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> Option<StaffIdentity> {
        self.users
            .iter()
            .find(|(user, pass, _)| user == username && pass == password)
            .map(|(_, _, identity)| identity.clone())
    }
}
