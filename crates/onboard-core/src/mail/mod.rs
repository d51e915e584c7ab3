//! Fire-and-forget mail dispatch.
//!
//! Producers enqueue a [`MailJob`] and move on; a worker thread drains the
//! queue and hands each job to a [`MailTransport`]. Delivery failures are
//! logged and invisible to producers — the login response and the request
//! update never wait on, or learn about, delivery.

use std::sync::mpsc;
use std::thread;

use thiserror::Error;
use tracing::{debug, warn};

/// A generated account identifier together with its clear-text credential,
/// for one-time delivery to the customer contact.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    /// Generated account identifier.
    pub account_id: String,
    /// Generated clear-text credential.
    pub credential: String,
}

/// A unit of outbound mail.
#[derive(Debug, Clone)]
pub enum MailJob {
    /// A two-factor login code.
    TwoFactorCode {
        /// Username the code was issued for.
        username: String,
        /// Recipient address.
        recipient: String,
        /// The 4-digit code.
        code: String,
    },
    /// Credentials generated during directory provisioning.
    CredentialsIssued {
        /// Company name of the completed request.
        company_name: String,
        /// Customer code of the completed request.
        customer_code: String,
        /// Recipient address (the request's contact email).
        recipient: String,
        /// One entry per provisioned account.
        credentials: Vec<IssuedCredential>,
    },
}

/// Delivery errors, visible only to the worker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MailError {
    /// The transport failed to deliver.
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

/// Producer side of the mail queue.
pub trait MailQueue: Send + Sync {
    /// Enqueues a job. Never blocks on delivery and never fails from the
    /// producer's point of view.
    fn enqueue(&self, job: MailJob);
}

/// Delivery backend consumed by the queue worker.
pub trait MailTransport: Send + Sync {
    /// Attempts to deliver one job.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails; the worker logs it and moves on.
    fn deliver(&self, job: &MailJob) -> Result<(), MailError>;
}

/// A queue backed by an unbounded channel and a worker thread.
#[derive(Debug)]
pub struct ChannelMailQueue {
    tx: mpsc::Sender<MailJob>,
}

impl ChannelMailQueue {
    /// Spawns the worker thread and returns the producer handle.
    #[must_use]
    pub fn spawn(transport: Box<dyn MailTransport>) -> Self {
        let (tx, rx) = mpsc::channel::<MailJob>();
        let spawned = thread::Builder::new()
            .name("mail-worker".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if let Err(err) = transport.deliver(&job) {
                        warn!(error = %err, "mail delivery failed");
                    }
                }
                debug!("mail worker shutting down");
            });
        if spawned.is_err() {
            warn!("failed to spawn mail worker; jobs will be dropped");
        }
        Self { tx }
    }
}

impl MailQueue for ChannelMailQueue {
    fn enqueue(&self, job: MailJob) {
        // A closed channel means the worker is gone; the job is dropped, and
        // that is invisible to the producer by contract.
        let _ = self.tx.send(job);
    }
}

/// A queue that drops every job. Used when mail is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMailQueue;

impl MailQueue for NullMailQueue {
    fn enqueue(&self, _job: MailJob) {}
}

/// A transport that only logs. Stands in for the out-of-band SMTP
/// collaborator, which is outside this crate's scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTransport;

impl MailTransport for LoggingTransport {
    fn deliver(&self, job: &MailJob) -> Result<(), MailError> {
        match job {
            MailJob::TwoFactorCode {
                username, recipient, ..
            } => debug!(username, recipient, "would deliver two-factor code"),
            MailJob::CredentialsIssued {
                company_name,
                recipient,
                credentials,
                ..
            } => debug!(
                company_name,
                recipient,
                accounts = credentials.len(),
                "would deliver provisioned credentials"
            ),
        }
        Ok(())
    }
}

/// A queue that records every job, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingMailQueue {
    jobs: std::sync::Mutex<Vec<MailJob>>,
}

impl RecordingMailQueue {
    /// Creates an empty recording queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything enqueued so far.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn jobs(&self) -> Vec<MailJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl MailQueue for RecordingMailQueue {
    fn enqueue(&self, job: MailJob) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job);
        }
    }
}
