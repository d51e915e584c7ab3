//! Two-factor challenge management.
//!
//! A successful primary login issues a 4-digit numeric code with a fixed
//! validity window (10 minutes by default) and hands delivery to the mail
//! queue. One challenge per user: re-issuing replaces any outstanding code.
//! Verification checks user+code and the expiry timestamp.
//!
//! There is no rate limiting or attempt counting, and a verified code is not
//! consumed until it expires or is replaced; callers that need stricter
//! semantics must add them in front of [`TwoFactorManager::verify`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::mail::{MailJob, MailQueue};
use crate::store::{RequestStore, StoreError, from_unix};

/// Number of digits in a generated code.
pub const CODE_DIGITS: u32 = 4;

/// Errors from challenge issue/verify.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TwoFactorError {
    /// No challenge matches the given user and code.
    #[error("no matching challenge for user '{username}'")]
    NotFound {
        /// The user that attempted verification.
        username: String,
    },

    /// The challenge matched but its validity window has passed.
    #[error("challenge for user '{username}' has expired")]
    ChallengeExpired {
        /// The user that attempted verification.
        username: String,
    },

    /// Underlying persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Time source, injectable for expiry tests.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// An issued challenge, as stored.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// The user the code was issued for.
    pub username: String,
    /// The 4-digit code.
    pub code: String,
    /// Issuance time.
    pub created_at: DateTime<Utc>,
    /// Expiry time (issuance plus the validity window).
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies one-time codes.
pub struct TwoFactorManager {
    store: RequestStore,
    mail: Arc<dyn MailQueue>,
    clock: Arc<dyn Clock>,
    validity: Duration,
}

impl TwoFactorManager {
    /// Creates a manager with the given validity window.
    #[must_use]
    pub fn new(
        store: RequestStore,
        mail: Arc<dyn MailQueue>,
        clock: Arc<dyn Clock>,
        validity: Duration,
    ) -> Self {
        Self {
            store,
            mail,
            clock,
            validity,
        }
    }

    /// Issues a fresh challenge for the user, replacing any outstanding one,
    /// and enqueues delivery of the code to the given address.
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge cannot be persisted. Mail delivery
    /// is fire-and-forget and cannot fail from here.
    pub fn issue(&self, username: &str, recipient: &str) -> Result<(), TwoFactorError> {
        let code = generate_code();
        let now = self.clock.now();
        let expires_at = now
            + chrono::Duration::from_std(self.validity)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO two_factor_challenges (username, code, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (username) DO UPDATE SET
                code = excluded.code,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at",
            params![username, code, now.timestamp(), expires_at.timestamp()],
        )
        .map_err(StoreError::from)?;
        drop(conn);

        self.mail.enqueue(MailJob::TwoFactorCode {
            username: username.to_string(),
            recipient: recipient.to_string(),
            code,
        });
        info!(username, "two-factor challenge issued");
        Ok(())
    }

    /// Verifies a user-supplied code against the stored challenge.
    ///
    /// # Errors
    ///
    /// Returns [`TwoFactorError::NotFound`] if no challenge matches the
    /// user+code pair and [`TwoFactorError::ChallengeExpired`] if the match
    /// is past its expiry.
    pub fn verify(&self, username: &str, code: &str) -> Result<(), TwoFactorError> {
        let conn = self.store.lock();
        let challenge =
            fetch_challenge(&conn, username, code)?.ok_or_else(|| TwoFactorError::NotFound {
                username: username.to_string(),
            })?;
        drop(conn);

        if self.clock.now() > challenge.expires_at {
            debug!(username, "expired code presented");
            return Err(TwoFactorError::ChallengeExpired {
                username: username.to_string(),
            });
        }
        info!(username, "two-factor challenge verified");
        Ok(())
    }
}

impl std::fmt::Debug for TwoFactorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoFactorManager")
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

/// Generates a zero-padded 4-digit numeric code.
fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..10u32.pow(CODE_DIGITS));
    format!("{n:0width$}", width = CODE_DIGITS as usize)
}

fn fetch_challenge(
    conn: &Connection,
    username: &str,
    code: &str,
) -> Result<Option<Challenge>, StoreError> {
    let row = conn
        .query_row(
            "SELECT username, code, created_at, expires_at
             FROM two_factor_challenges WHERE username = ?1 AND code = ?2",
            params![username, code],
            |row| {
                Ok(Challenge {
                    username: row.get(0)?,
                    code: row.get(1)?,
                    created_at: from_unix(row.get(2)?),
                    expires_at: from_unix(row.get(3)?),
                })
            },
        )
        .optional()?;
    Ok(row)
}
