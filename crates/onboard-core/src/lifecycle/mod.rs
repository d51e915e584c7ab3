//! The request lifecycle state machine.
//!
//! Validates transitions, applies field changes, records every mutation in
//! the audit history, and triggers external directory provisioning when a
//! request reaches Completed.
//!
//! Every mutating operation runs as one immediate transaction over the
//! store's connection: read current row, compute the diff, write the row,
//! write the history entry, commit. The directory gateway fires only after
//! commit, with the connection lock released — local success never depends
//! on the external store, and gateway failures are logged, not surfaced.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::TransactionBehavior;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crate::audit::ActorContext;
use crate::directory::Provisioner;
use crate::request::{
    ListFilter, NewRequest, RequestDetail, RequestPatch, RequestRecord, RequestStats,
    RequestStatus,
};
use crate::storage::{FileRef, FileStore, StorageError};
use crate::store::{self, RequestStore, StoreError};
use crate::{audit, store::normalize_code};

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    /// No request with the given id.
    #[error("request not found: id={id}")]
    NotFound {
        /// The id that was looked up.
        id: i64,
    },

    /// The customer code is already taken by another request.
    #[error("customer code already in use: '{code}'")]
    DuplicateCustomerCode {
        /// The conflicting code.
        code: String,
    },

    /// The request is Completed and can no longer be modified.
    #[error("request {id} is completed and can no longer be modified")]
    TerminalStateViolation {
        /// The blocked request.
        id: i64,
    },

    /// Approve was called on an already Completed request.
    #[error("request {id} is already completed")]
    AlreadyCompleted {
        /// The blocked request.
        id: i64,
    },

    /// Reject was called from a status that does not allow it.
    #[error("cannot reject request {id} from status '{from}'")]
    InvalidTransition {
        /// The blocked request.
        id: i64,
        /// Its current status.
        from: RequestStatus,
    },

    /// Attachment byte storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Underlying persistence failure.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { id },
            StoreError::DuplicateCustomerCode { code } => Self::DuplicateCustomerCode { code },
            other => Self::Store(other),
        }
    }
}

/// Code and roles granted atomically with an approval.
#[derive(Debug, Clone, Default)]
pub struct ApprovalGrant {
    /// Customer code to assign. Must be unique if supplied.
    pub customer_code: Option<String>,
    /// Role tags to assign.
    pub roles: Option<Vec<String>>,
}

/// The lifecycle engine.
pub struct LifecycleEngine {
    store: RequestStore,
    provisioner: Arc<Provisioner>,
    files: Arc<dyn FileStore>,
}

impl LifecycleEngine {
    /// Creates an engine over the given store and collaborators.
    #[must_use]
    pub fn new(
        store: RequestStore,
        provisioner: Arc<Provisioner>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            store,
            provisioner,
            files,
        }
    }

    /// The underlying store (read API).
    #[must_use]
    pub const fn store(&self) -> &RequestStore {
        &self.store
    }

    /// Creates a request with its authorized persons and appends the
    /// creation history entry.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DuplicateCustomerCode`] if a supplied code
    /// collides; nothing is persisted in that case.
    pub fn create(
        &self,
        new: &NewRequest,
        actor: &ActorContext,
    ) -> Result<RequestDetail, LifecycleError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let id = store::insert_request(
            &tx,
            new,
            actor.username.as_deref(),
            actor.source_ip.as_deref(),
            Utc::now(),
        )?;
        store::replace_persons(&tx, id, &new.authorized_persons)?;

        let action = if new.uploaded_files.is_empty() {
            "Request created.".to_string()
        } else {
            format!("Request created. Files: {}.", new.uploaded_files.join(", "))
        };
        audit::append(&tx, id, actor, &action)?;

        let detail = store::load_detail(&tx, id)?;
        tx.commit().map_err(StoreError::from)?;
        info!(request_id = id, "request created");
        Ok(detail)
    }

    /// Applies a partial update.
    ///
    /// Only supplied fields are considered; each actual change is recorded
    /// as a human-readable fragment, and one history entry joining all
    /// fragments is appended when anything changed. Supplying a non-empty
    /// customer code transitions the request to Completed, which triggers
    /// directory provisioning after commit.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TerminalStateViolation`] if the request is
    /// already Completed, [`LifecycleError::NotFound`] for a missing id, and
    /// [`LifecycleError::DuplicateCustomerCode`] if the written code
    /// collides (nothing is persisted in that case).
    pub fn update(
        &self,
        id: i64,
        patch: &RequestPatch,
        actor: &ActorContext,
    ) -> Result<RequestDetail, LifecycleError> {
        // Byte storage is not transactional. Bytes of removed attachments
        // are unlinked only once the row delete is durable, and bytes saved
        // for new attachments are unlinked again if the transaction rolls
        // back, so a failed update leaves neither dangling references nor
        // orphan bytes.
        let mut saved = Vec::new();
        let mut pending_deletes = Vec::new();
        match self.apply_update(id, patch, actor, &mut saved, &mut pending_deletes) {
            Ok((detail, became_completed)) => {
                for file_ref in pending_deletes {
                    if let Err(err) = self.files.delete(&file_ref) {
                        warn!(request_id = id, error = %err, "removed attachment left stray bytes");
                    }
                }
                if became_completed {
                    self.provisioner
                        .provision(&detail.request, &detail.authorized_persons);
                }
                Ok(detail)
            }
            Err(err) => {
                for file_ref in saved {
                    if let Err(cleanup_err) = self.files.delete(&file_ref) {
                        warn!(request_id = id, error = %cleanup_err, "failed update left stray bytes");
                    }
                }
                Err(err)
            }
        }
    }

    fn apply_update(
        &self,
        id: i64,
        patch: &RequestPatch,
        actor: &ActorContext,
        saved: &mut Vec<FileRef>,
        pending_deletes: &mut Vec<FileRef>,
    ) -> Result<(RequestDetail, bool), LifecycleError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let current = store::fetch_request(&tx, id)?;
        if current.status.is_terminal() {
            return Err(LifecycleError::TerminalStateViolation { id });
        }

        let mut updated = current.clone();
        let mut changes: Vec<String> = Vec::new();

        apply_scalar_changes(&mut updated, patch, &mut changes);

        if let Some(status) = patch.status {
            if status != updated.status {
                changes.push(format!(
                    "status changed from '{}' to '{}'.",
                    updated.status, status
                ));
                updated.status = status;
            }
        }

        if let Some(roles) = &patch.roles {
            if *roles != updated.roles {
                changes.push(format!(
                    "roles changed from '{}' to '{}'.",
                    updated.roles.join(", "),
                    roles.join(", ")
                ));
                updated.roles.clone_from(roles);
            }
        }

        let mut code_supplied = false;
        if let Some(raw) = patch.customer_code.as_deref() {
            let code = normalize_code(Some(raw));
            code_supplied = code.is_some();
            if code != updated.customer_code {
                changes.push(format!(
                    "customer_code changed from '{}' to '{}'.",
                    updated.customer_code.as_deref().unwrap_or(""),
                    code.as_deref().unwrap_or("")
                ));
                updated.customer_code = code;
            }
        }

        if let Some(specs) = &patch.authorized_persons {
            store::replace_persons(&tx, id, specs)?;
            changes.push("Authorized persons updated.".to_string());
        }

        for attachment_id in &patch.remove_attachments {
            let Some(attachment) = store::fetch_attachment(&tx, *attachment_id, id)? else {
                debug!(request_id = id, attachment_id, "attachment not found, skipping");
                continue;
            };
            store::delete_attachment_row(&tx, attachment.id)?;
            pending_deletes.push(FileRef(attachment.file_ref.clone()));
            changes.push(format!(
                "Attachment '{}' removed.",
                attachment.original_filename
            ));
        }

        for new_attachment in &patch.add_attachments {
            let file_ref = self
                .files
                .save(&new_attachment.filename, &new_attachment.bytes)?;
            saved.push(file_ref.clone());
            store::insert_attachment(&tx, id, &file_ref.0, &new_attachment.filename)?;
            changes.push(format!("Attachment '{}' added.", new_attachment.filename));
        }

        // Assigning a customer code is what completes a request.
        if code_supplied && !updated.status.is_terminal() {
            updated.status = RequestStatus::Completed;
            changes.push("Status changed to 'Completed'.".to_string());
        }

        if !changes.is_empty() {
            store::save_request(&tx, &updated)?;
            audit::append(&tx, id, actor, &changes.join(" "))?;
        }

        let detail = store::load_detail(&tx, id)?;
        let became_completed =
            !current.status.is_terminal() && detail.request.status.is_terminal();

        tx.commit().map_err(StoreError::from)?;
        Ok((detail, became_completed))
    }

    /// Approves a request: sets status to Completed, optionally assigning
    /// the final customer code and role set atomically with the transition.
    /// Triggers directory provisioning after commit.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyCompleted`] if the request is
    /// already Completed and [`LifecycleError::DuplicateCustomerCode`] if a
    /// granted code collides.
    pub fn approve(
        &self,
        id: i64,
        grant: &ApprovalGrant,
        actor: &ActorContext,
    ) -> Result<RequestDetail, LifecycleError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let mut request = store::fetch_request(&tx, id)?;
        if request.status.is_terminal() {
            return Err(LifecycleError::AlreadyCompleted { id });
        }

        if let Some(code) = grant.customer_code.as_deref() {
            request.customer_code = normalize_code(Some(code));
        }
        if let Some(roles) = &grant.roles {
            request.roles.clone_from(roles);
        }
        request.status = RequestStatus::Completed;
        store::save_request(&tx, &request)?;
        audit::append(&tx, id, actor, "Request approved and marked as completed.")?;

        let detail = store::load_detail(&tx, id)?;
        tx.commit().map_err(StoreError::from)?;
        drop(conn);

        info!(request_id = id, "request approved");
        self.provisioner
            .provision(&detail.request, &detail.authorized_persons);
        Ok(detail)
    }

    /// Rejects a request.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] if the request is
    /// already Rejected or Completed.
    pub fn reject(
        &self,
        id: i64,
        notes: Option<&str>,
        actor: &ActorContext,
    ) -> Result<RequestDetail, LifecycleError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let mut request = store::fetch_request(&tx, id)?;
        if matches!(
            request.status,
            RequestStatus::Rejected | RequestStatus::Completed
        ) {
            return Err(LifecycleError::InvalidTransition {
                id,
                from: request.status,
            });
        }

        request.status = RequestStatus::Rejected;
        if let Some(notes) = notes {
            request.rejection_notes = Some(notes.to_string());
        }
        store::save_request(&tx, &request)?;
        audit::append(&tx, id, actor, "Request rejected.")?;

        let detail = store::load_detail(&tx, id)?;
        tx.commit().map_err(StoreError::from)?;
        info!(request_id = id, "request rejected");
        Ok(detail)
    }

    /// Soft-deletes a request by clearing its active flag. The row and its
    /// history remain.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TerminalStateViolation`] if the request is
    /// Completed.
    pub fn soft_delete(&self, id: i64, actor: &ActorContext) -> Result<(), LifecycleError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let mut request = store::fetch_request(&tx, id)?;
        if request.status.is_terminal() {
            return Err(LifecycleError::TerminalStateViolation { id });
        }

        request.active = false;
        store::save_request(&tx, &request)?;
        audit::append(&tx, id, actor, "Request deleted (marked inactive).")?;
        tx.commit().map_err(StoreError::from)?;
        info!(request_id = id, "request soft-deleted");
        Ok(())
    }

    /// Fetches a request with persons, history, and attachments.
    /// Soft-deleted requests are still returned.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] if the id does not exist.
    pub fn get(&self, id: i64) -> Result<RequestDetail, LifecycleError> {
        Ok(self.store.get(id)?)
    }

    /// Lists active requests matching the filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<RequestRecord>, LifecycleError> {
        Ok(self.store.list(filter)?)
    }

    /// Counts active requests by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<RequestStats, LifecycleError> {
        Ok(self.store.stats()?)
    }
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine").finish_non_exhaustive()
    }
}

/// Applies every supplied scalar field whose value differs, recording one
/// fragment per change.
fn apply_scalar_changes(record: &mut RequestRecord, patch: &RequestPatch, changes: &mut Vec<String>) {
    apply_string(&mut record.company_name, patch.company_name.as_deref(), "company_name", changes);
    apply_string(&mut record.address, patch.address.as_deref(), "address", changes);
    apply_string(&mut record.city, patch.city.as_deref(), "city", changes);
    apply_string(&mut record.state, patch.state.as_deref(), "state", changes);
    apply_string(&mut record.phone, patch.phone.as_deref(), "phone", changes);
    apply_string(&mut record.email, patch.email.as_deref(), "email", changes);
    apply_string(&mut record.tax_id, patch.tax_id.as_deref(), "tax_id", changes);
    apply_string(&mut record.contact_name, patch.contact_name.as_deref(), "contact_name", changes);
    apply_string(
        &mut record.contact_position,
        patch.contact_position.as_deref(),
        "contact_position",
        changes,
    );
    apply_string(
        &mut record.contact_phone,
        patch.contact_phone.as_deref(),
        "contact_phone",
        changes,
    );
    apply_string(
        &mut record.contact_email,
        patch.contact_email.as_deref(),
        "contact_email",
        changes,
    );
    apply_optional(&mut record.notes, patch.notes.as_deref(), "notes", changes);
    apply_optional(
        &mut record.rejection_notes,
        patch.rejection_notes.as_deref(),
        "rejection_notes",
        changes,
    );
}

fn apply_string(field: &mut String, supplied: Option<&str>, name: &str, changes: &mut Vec<String>) {
    if let Some(value) = supplied {
        if field != value {
            changes.push(format!("{name} changed from '{field}' to '{value}'."));
            *field = value.to_string();
        }
    }
}

fn apply_optional(
    field: &mut Option<String>,
    supplied: Option<&str>,
    name: &str,
    changes: &mut Vec<String>,
) {
    if let Some(value) = supplied {
        if field.as_deref() != Some(value) {
            changes.push(format!(
                "{name} changed from '{}' to '{value}'.",
                field.as_deref().unwrap_or("")
            ));
            *field = Some(value.to_string());
        }
    }
}

#[cfg(test)]
mod tests;
