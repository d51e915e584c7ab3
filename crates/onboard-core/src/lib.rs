//! Customer-onboarding request management core.
//!
//! External parties submit company/contact registration requests, staff
//! review and approve or reject them, and approved requests are provisioned
//! into an external account directory. Every mutation is recorded in an
//! append-only per-request history.
//!
//! # Architecture
//!
//! ```text
//! LifecycleEngine (request state machine)
//!     |
//!     +-- store       SQLite persistence (requests, persons, history, ...)
//!     +-- audit       append-only history writer
//!     +-- directory   Provisioner -> AccountDirectory (external, best-effort)
//!     +-- storage     FileStore (attachment bytes)
//!
//! SyncImporter        UpstreamFeed -> store (upsert by external id)
//! AuthFlow            DirectoryAuthenticator -> TwoFactorManager -> TokenIssuer
//! MailQueue           fire-and-forget delivery hand-off
//! ```
//!
//! Local state is the source of truth: external directory and upstream feed
//! failures are logged and never surfaced to the caller of the triggering
//! operation. The directory gateway fires only after the local transaction
//! has committed.

pub mod audit;
pub mod auth;
pub mod config;
pub mod directory;
pub mod importer;
pub mod lifecycle;
pub mod mail;
pub mod request;
pub mod storage;
pub mod store;
pub mod twofactor;

pub use config::{ConfigError, OnboardConfig};
pub use lifecycle::{ActorContext, ApprovalGrant, LifecycleEngine, LifecycleError};
pub use request::{
    AuthorizedPerson, AuthorizedPersonSpec, ListFilter, NewRequest, RequestDetail, RequestPatch,
    RequestRecord, RequestStats, RequestStatus,
};
pub use store::{RequestStore, StoreError};
