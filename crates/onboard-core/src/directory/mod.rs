//! External account directory gateway.
//!
//! When a request reaches Completed, every authorized person on it is
//! provisioned into an external account store: a generated account
//! identifier, a generated credential (delivered to the customer contact via
//! the mail queue, stored externally only as a hash), and one role binding
//! per role tag on the request.
//!
//! # Failure semantics
//!
//! Provisioning is strictly best-effort. Each person-insert and each
//! role-binding call is attempted independently; failures are logged and do
//! not stop processing of subsequent persons or roles. A connectivity
//! failure at the start of the operation is logged and treated as a no-op.
//! The surrounding request update has already committed and reports success
//! regardless of anything that happens here. Connections are scoped to one
//! invocation: acquired fresh, released unconditionally.
//!
//! # Legacy credential hash
//!
//! The external store expects MD5 (lowercase hex, 32 chars). This is a known
//! weak algorithm kept only for wire compatibility; the upgrade path is to
//! dual-write a modern hash in a new field until the external store
//! migrates.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DirectoryConfig;
use crate::mail::{IssuedCredential, MailJob, MailQueue};
use crate::request::{AuthorizedPerson, RequestRecord};

/// Minimum generated credential length.
pub const CREDENTIAL_LENGTH: usize = 10;

/// Errors from the external directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DirectoryError {
    /// Could not establish a connection/session.
    #[error("directory connection failed: {0}")]
    Connect(String),

    /// A person-insert or role-binding call failed.
    #[error("directory call failed: {0}")]
    Call(String),
}

/// An account-creation record as submitted to the external store.
#[derive(Debug, Clone, Serialize)]
pub struct AccountRecord {
    /// Generated account identifier. Derived from the person's name;
    /// collisions are possible and not checked (legacy behavior).
    pub account_id: String,
    /// Person's display name.
    pub display_name: String,
    /// Customer code of the owning request.
    pub customer_code: String,
    /// Person's phone number.
    pub phone: String,
    /// Hashed credential (legacy MD5 hex).
    pub password_hash: String,
    /// Person's email address, empty if none.
    pub email: String,
    /// Company address of the owning request.
    pub address: String,
    /// System-attributed creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Origin marker identifying this system as the writer.
    pub origin: String,
}

/// A role-binding record as submitted to the external store.
#[derive(Debug, Clone, Serialize)]
pub struct RoleBinding {
    /// Freshly generated unique binding identifier.
    pub binding_id: String,
    /// Generated account identifier being bound.
    pub account_id: String,
    /// Role tag.
    pub role: String,
}

/// One connection-scoped session against the external store.
pub trait DirectorySession {
    /// Submits an account-creation call.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails; the caller logs it and
    /// continues.
    fn insert_account(&mut self, record: &AccountRecord) -> Result<(), DirectoryError>;

    /// Submits a role-binding call.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails; the caller logs it and
    /// continues.
    fn bind_role(&mut self, binding: &RoleBinding) -> Result<(), DirectoryError>;
}

/// The external account directory. Sessions are acquired fresh per
/// provisioning run and dropped when it ends, success or failure.
pub trait AccountDirectory: Send + Sync {
    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable; the provisioning run
    /// becomes a logged no-op.
    fn connect(&self) -> Result<Box<dyn DirectorySession + '_>, DirectoryError>;
}

/// Outcome counts for one provisioning run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisioningReport {
    /// Person-insert calls attempted.
    pub accounts_attempted: usize,
    /// Person-insert calls that succeeded.
    pub accounts_created: usize,
    /// Role-binding calls attempted.
    pub bindings_attempted: usize,
    /// Role-binding calls that succeeded.
    pub bindings_created: usize,
}

impl ProvisioningReport {
    /// Whether every attempted call succeeded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.accounts_created == self.accounts_attempted
            && self.bindings_created == self.bindings_attempted
    }
}

/// Provisions authorized persons of newly completed requests.
pub struct Provisioner {
    directory: Arc<dyn AccountDirectory>,
    mail: Arc<dyn MailQueue>,
    origin: String,
}

impl Provisioner {
    /// Creates a provisioner writing through the given directory.
    #[must_use]
    pub fn new(directory: Arc<dyn AccountDirectory>, mail: Arc<dyn MailQueue>, origin: impl Into<String>) -> Self {
        Self {
            directory,
            mail,
            origin: origin.into(),
        }
    }

    /// Runs one best-effort provisioning pass. Never fails; the report says
    /// what was attempted and what stuck.
    pub fn provision(
        &self,
        request: &RequestRecord,
        persons: &[AuthorizedPerson],
    ) -> ProvisioningReport {
        let mut report = ProvisioningReport::default();
        if persons.is_empty() {
            return report;
        }

        let mut session = match self.directory.connect() {
            Ok(session) => session,
            Err(err) => {
                warn!(request_id = request.id, error = %err, "directory unreachable, provisioning skipped");
                return report;
            }
        };

        let customer_code = request.customer_code.clone().unwrap_or_default();
        let mut credentials = Vec::new();

        for person in persons {
            let account_id = derive_account_id(&person.name);
            let credential = generate_credential(CREDENTIAL_LENGTH);
            let record = AccountRecord {
                account_id: account_id.clone(),
                display_name: person.name.clone(),
                customer_code: customer_code.clone(),
                phone: person.phone.clone(),
                password_hash: legacy_credential_hash(&credential),
                email: person.email.clone().unwrap_or_default(),
                address: request.address.clone(),
                created_at: Utc::now(),
                origin: self.origin.clone(),
            };

            report.accounts_attempted += 1;
            match session.insert_account(&record) {
                Ok(()) => {
                    report.accounts_created += 1;
                    credentials.push(IssuedCredential {
                        account_id: account_id.clone(),
                        credential,
                    });
                }
                Err(err) => {
                    warn!(request_id = request.id, account_id, error = %err, "account insert failed");
                }
            }

            for role in &request.roles {
                let binding = RoleBinding {
                    binding_id: Uuid::new_v4().to_string(),
                    account_id: account_id.clone(),
                    role: role.clone(),
                };
                report.bindings_attempted += 1;
                match session.bind_role(&binding) {
                    Ok(()) => report.bindings_created += 1,
                    Err(err) => {
                        warn!(request_id = request.id, account_id, role, error = %err, "role binding failed");
                    }
                }
            }
        }

        if !credentials.is_empty() {
            self.mail.enqueue(MailJob::CredentialsIssued {
                company_name: request.company_name.clone(),
                customer_code,
                recipient: request.contact_email.clone(),
                credentials,
            });
        }

        info!(
            request_id = request.id,
            accounts = report.accounts_created,
            bindings = report.bindings_created,
            complete = report.is_complete(),
            "provisioning pass finished"
        );
        report
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Derives an account identifier from a display name: first name part in
/// full, then the initial of each remaining part, upper-cased.
///
/// `"Juan Perez Garcia"` becomes `"JUANPG"`. Collisions are possible and
/// deliberately not checked.
#[must_use]
pub fn derive_account_id(name: &str) -> String {
    let mut parts = name.split_whitespace();
    let mut id = String::new();
    if let Some(first) = parts.next() {
        id.push_str(first);
    }
    for part in parts {
        if let Some(initial) = part.chars().next() {
            id.push(initial);
        }
    }
    id.to_uppercase()
}

/// Generates a random credential of mixed letters and digits.
#[must_use]
pub fn generate_credential(length: usize) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect();
        let has_letter = candidate.chars().any(|c| c.is_ascii_alphabetic());
        let has_digit = candidate.chars().any(|c| c.is_ascii_digit());
        if has_letter && has_digit {
            return candidate;
        }
    }
}

/// Hashes a credential the way the legacy external store expects: MD5,
/// lowercase hex. Weak by modern standards; kept for wire compatibility.
#[must_use]
pub fn legacy_credential_hash(credential: &str) -> String {
    hex::encode(Md5::digest(credential.as_bytes()))
}

// =============================================================================
// HTTP-backed directory
// =============================================================================

/// An HTTP directory client posting JSON records to the external store.
///
/// `POST {endpoint}/accounts` for person inserts and
/// `POST {endpoint}/role-bindings` for role bindings.
pub struct HttpDirectory {
    endpoint: String,
    timeout: Duration,
}

impl HttpDirectory {
    /// Creates a client for the configured endpoint.
    #[must_use]
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl std::fmt::Debug for HttpDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDirectory")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl AccountDirectory for HttpDirectory {
    fn connect(&self) -> Result<Box<dyn DirectorySession + '_>, DirectoryError> {
        if self.endpoint.is_empty() {
            return Err(DirectoryError::Connect(
                "no directory endpoint configured".to_string(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| DirectoryError::Connect(e.to_string()))?;
        Ok(Box::new(HttpDirectorySession {
            client,
            endpoint: self.endpoint.clone(),
        }))
    }
}

struct HttpDirectorySession {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpDirectorySession {
    fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), DirectoryError> {
        self.client
            .post(format!("{}/{path}", self.endpoint))
            .json(body)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| DirectoryError::Call(e.to_string()))?;
        Ok(())
    }
}

impl DirectorySession for HttpDirectorySession {
    fn insert_account(&mut self, record: &AccountRecord) -> Result<(), DirectoryError> {
        self.post("accounts", record)
    }

    fn bind_role(&mut self, binding: &RoleBinding) -> Result<(), DirectoryError> {
        self.post("role-bindings", binding)
    }
}

// =============================================================================
// Mock directory (for tests and for running without an external store)
// =============================================================================

/// Shared state behind a [`MockDirectory`].
#[derive(Debug, Default)]
pub struct MockDirectoryState {
    /// Accounts received so far.
    pub accounts: Vec<AccountRecord>,
    /// Role bindings received so far.
    pub bindings: Vec<RoleBinding>,
    /// When true, `connect` fails.
    pub fail_connect: bool,
    /// When true, every `insert_account` fails.
    pub fail_inserts: bool,
    /// When true, every `bind_role` fails.
    pub fail_bindings: bool,
}

/// An in-memory directory that records every call.
#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    state: Arc<Mutex<MockDirectoryState>>,
}

impl MockDirectory {
    /// Creates a directory that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory whose `connect` always fails.
    #[must_use]
    pub fn unreachable() -> Self {
        let mock = Self::default();
        mock.state_mut(|s| s.fail_connect = true);
        mock
    }

    /// Mutates the shared state.
    #[allow(clippy::missing_panics_doc)]
    pub fn state_mut(&self, f: impl FnOnce(&mut MockDirectoryState)) {
        f(&mut self.state.lock().unwrap());
    }

    /// Reads the shared state.
    #[allow(clippy::missing_panics_doc)]
    pub fn snapshot<T>(&self, f: impl FnOnce(&MockDirectoryState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }
}

impl AccountDirectory for MockDirectory {
    fn connect(&self) -> Result<Box<dyn DirectorySession + '_>, DirectoryError> {
        if self.snapshot(|s| s.fail_connect) {
            return Err(DirectoryError::Connect("mock directory unreachable".to_string()));
        }
        Ok(Box::new(MockSession {
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<MockDirectoryState>>,
}

impl DirectorySession for MockSession {
    fn insert_account(&mut self, record: &AccountRecord) -> Result<(), DirectoryError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DirectoryError::Call("mock state poisoned".to_string()))?;
        if state.fail_inserts {
            return Err(DirectoryError::Call("mock insert failure".to_string()));
        }
        state.accounts.push(record.clone());
        Ok(())
    }

    fn bind_role(&mut self, binding: &RoleBinding) -> Result<(), DirectoryError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DirectoryError::Call("mock state poisoned".to_string()))?;
        if state.fail_bindings {
            return Err(DirectoryError::Call("mock binding failure".to_string()));
        }
        state.bindings.push(binding.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests;
