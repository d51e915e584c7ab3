//! Domain types for onboarding requests.
//!
//! A [`RequestRecord`] is a customer-onboarding submission moving through
//! Pending/Rejected/Completed. [`AuthorizedPerson`] rows are owned by their
//! request; replacing the person list is always a full replace, never a
//! diff.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an onboarding request.
///
/// `Completed` is terminal: once a request completes, no field mutation is
/// permitted. `Rejected` is not terminal; a later edit reopens the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Awaiting staff review.
    Pending,
    /// Rejected by staff. A later edit reopens the request.
    Rejected,
    /// Approved and provisioned. Terminal.
    Completed,
}

impl RequestStatus {
    /// Canonical string form, as stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Rejected => "Rejected",
            Self::Completed => "Completed",
        }
    }

    /// Parses the canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Rejected" => Some(Self::Rejected),
            "Completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether this status blocks all further mutation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted customer-onboarding request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    /// Primary key. For imported requests this is the upstream feed's id.
    pub id: i64,
    /// Company name.
    pub company_name: String,
    /// Company street address.
    pub address: String,
    /// Company city.
    pub city: String,
    /// Company state/province.
    pub state: String,
    /// Company phone number.
    pub phone: String,
    /// Company email address.
    pub email: String,
    /// Company tax identifier.
    pub tax_id: String,
    /// Contact person name.
    pub contact_name: String,
    /// Contact person position.
    pub contact_position: String,
    /// Contact person phone number.
    pub contact_phone: String,
    /// Contact person email address.
    pub contact_email: String,
    /// Externally meaningful account key. `None` until assigned; once
    /// non-empty it is globally unique across active and inactive requests.
    pub customer_code: Option<String>,
    /// Role tags granted on completion (e.g. `["ICT", "DC"]`).
    pub roles: Vec<String>,
    /// Free-text staff notes.
    pub notes: Option<String>,
    /// Free-text rejection notes.
    pub rejection_notes: Option<String>,
    /// Lifecycle status.
    pub status: RequestStatus,
    /// Soft-delete flag. Inactive requests are hidden from lists but remain
    /// fetchable by id.
    pub active: bool,
    /// Username of the creator. `None` for anonymous or imported requests.
    pub created_by: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Source address of the creating call.
    pub created_from_ip: Option<String>,
    /// Externally-supplied uploaded-file names (by reference only).
    pub uploaded_files: Vec<String>,
}

/// A person granted access under a request, provisioned externally on
/// completion.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizedPerson {
    /// Primary key.
    pub id: i64,
    /// Owning request.
    pub request_id: i64,
    /// Display name.
    pub name: String,
    /// Position/title.
    pub position: String,
    /// Phone number.
    pub phone: String,
    /// Email address, if any.
    pub email: Option<String>,
    /// Informational-access capability flag.
    pub informational: bool,
    /// Operational-access capability flag.
    pub operational: bool,
    /// Free-text association label (department, site, ...).
    pub associated_with: String,
}

/// Input spec for an authorized person (create or replace).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizedPersonSpec {
    /// Display name.
    pub name: String,
    /// Position/title.
    #[serde(default)]
    pub position: String,
    /// Phone number.
    #[serde(default)]
    pub phone: String,
    /// Email address, if any.
    #[serde(default)]
    pub email: Option<String>,
    /// Informational-access capability flag.
    #[serde(default)]
    pub informational: bool,
    /// Operational-access capability flag.
    #[serde(default)]
    pub operational: bool,
    /// Free-text association label.
    #[serde(default)]
    pub associated_with: String,
}

/// An immutable audit entry. Created once per mutating operation that
/// actually changed state; never updated or deleted.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Primary key.
    pub id: i64,
    /// Owning request.
    pub request_id: i64,
    /// Acting username. `None` for system-initiated changes.
    pub actor: Option<String>,
    /// Source address of the mutating call.
    pub source_ip: Option<String>,
    /// Human-readable description of what changed.
    pub action: String,
    /// Assigned at write time, never updated.
    pub changed_at: DateTime<Utc>,
}

/// An uploaded file bound to a request.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentRecord {
    /// Primary key.
    pub id: i64,
    /// Owning request.
    pub request_id: i64,
    /// Stored file reference (relative to the media root).
    pub file_ref: String,
    /// Original filename as uploaded.
    pub original_filename: String,
}

/// Full field set for creating a request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRequest {
    /// Company name.
    pub company_name: String,
    /// Company street address.
    #[serde(default)]
    pub address: String,
    /// Company city.
    #[serde(default)]
    pub city: String,
    /// Company state/province.
    #[serde(default)]
    pub state: String,
    /// Company phone number.
    #[serde(default)]
    pub phone: String,
    /// Company email address.
    #[serde(default)]
    pub email: String,
    /// Company tax identifier.
    #[serde(default)]
    pub tax_id: String,
    /// Contact person name.
    #[serde(default)]
    pub contact_name: String,
    /// Contact person position.
    #[serde(default)]
    pub contact_position: String,
    /// Contact person phone number.
    #[serde(default)]
    pub contact_phone: String,
    /// Contact person email address.
    #[serde(default)]
    pub contact_email: String,
    /// Customer code, if already assigned. Must be unique.
    #[serde(default)]
    pub customer_code: Option<String>,
    /// Role tags.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Free-text notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Uploaded-file names (by reference).
    #[serde(default)]
    pub uploaded_files: Vec<String>,
    /// Authorized persons to create with the request.
    #[serde(default)]
    pub authorized_persons: Vec<AuthorizedPersonSpec>,
}

/// One upstream feed record, reduced to the columns the importer owns.
///
/// The feed's own identifier is reused as the local primary key. An upsert
/// overwrites exactly these fields and reactivates the row; status, customer
/// code, notes, and staff-written columns are never touched.
#[derive(Debug, Clone, Default)]
pub struct ImportedRequest {
    /// Upstream identifier, reused as the local primary key.
    pub id: i64,
    /// Company name.
    pub company_name: String,
    /// Company street address.
    pub address: String,
    /// Company city.
    pub city: String,
    /// Company state/province.
    pub state: String,
    /// Company phone number.
    pub phone: String,
    /// Company email address.
    pub email: String,
    /// Company tax identifier.
    pub tax_id: String,
    /// Contact person name.
    pub contact_name: String,
    /// Contact person position.
    pub contact_position: String,
    /// Contact person phone number.
    pub contact_phone: String,
    /// Contact person email address.
    pub contact_email: String,
    /// Submission timestamp as reported by the feed.
    pub created_at: Option<DateTime<Utc>>,
    /// Submitter address as reported by the feed.
    pub created_from_ip: Option<String>,
    /// Uploaded-file names carried by the feed record.
    pub uploaded_files: Vec<String>,
    /// Full replacement of the authorized-person list.
    pub authorized_persons: Vec<AuthorizedPersonSpec>,
}

/// A new attachment to store alongside a request.
#[derive(Debug, Clone, Default)]
pub struct NewAttachment {
    /// Original filename.
    pub filename: String,
    /// Raw file content.
    pub bytes: Vec<u8>,
}

/// Partial field set for updating a request. Only supplied fields are
/// considered; `authorized_persons`, when supplied (even empty), replaces
/// the whole person list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestPatch {
    /// Company name.
    #[serde(default)]
    pub company_name: Option<String>,
    /// Company street address.
    #[serde(default)]
    pub address: Option<String>,
    /// Company city.
    #[serde(default)]
    pub city: Option<String>,
    /// Company state/province.
    #[serde(default)]
    pub state: Option<String>,
    /// Company phone number.
    #[serde(default)]
    pub phone: Option<String>,
    /// Company email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Company tax identifier.
    #[serde(default)]
    pub tax_id: Option<String>,
    /// Contact person name.
    #[serde(default)]
    pub contact_name: Option<String>,
    /// Contact person position.
    #[serde(default)]
    pub contact_position: Option<String>,
    /// Contact person phone number.
    #[serde(default)]
    pub contact_phone: Option<String>,
    /// Contact person email address.
    #[serde(default)]
    pub contact_email: Option<String>,
    /// Customer code. Supplying a non-empty value completes the request.
    #[serde(default)]
    pub customer_code: Option<String>,
    /// Status to apply directly.
    #[serde(default)]
    pub status: Option<RequestStatus>,
    /// Role tags (compared as a list).
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    /// Free-text notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Free-text rejection notes.
    #[serde(default)]
    pub rejection_notes: Option<String>,
    /// Full replacement of the authorized-person list.
    #[serde(default)]
    pub authorized_persons: Option<Vec<AuthorizedPersonSpec>>,
    /// Attachments to create.
    #[serde(skip)]
    pub add_attachments: Vec<NewAttachment>,
    /// Attachment ids to delete (bytes first, then the row).
    #[serde(default)]
    pub remove_attachments: Vec<i64>,
}

impl RequestPatch {
    /// Whether the patch carries no instructions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.company_name.is_none()
            && self.address.is_none()
            && self.city.is_none()
            && self.state.is_none()
            && self.phone.is_none()
            && self.email.is_none()
            && self.tax_id.is_none()
            && self.contact_name.is_none()
            && self.contact_position.is_none()
            && self.contact_phone.is_none()
            && self.contact_email.is_none()
            && self.customer_code.is_none()
            && self.status.is_none()
            && self.roles.is_none()
            && self.notes.is_none()
            && self.rejection_notes.is_none()
            && self.authorized_persons.is_none()
            && self.add_attachments.is_empty()
            && self.remove_attachments.is_empty()
    }
}

/// List filters. All are optional and combine with AND.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Exact status match.
    pub status: Option<RequestStatus>,
    /// Case-insensitive company-name substring.
    pub company_name: Option<String>,
    /// Case-insensitive email substring.
    pub email: Option<String>,
    /// Role-set containment (case-insensitive substring over the role tags).
    pub role: Option<String>,
}

/// A request together with its owned rows.
#[derive(Debug, Clone, Serialize)]
pub struct RequestDetail {
    /// The request itself.
    pub request: RequestRecord,
    /// Authorized persons, in insertion order.
    pub authorized_persons: Vec<AuthorizedPerson>,
    /// History, newest first.
    pub history: Vec<HistoryEntry>,
    /// Attachments, in insertion order.
    pub attachments: Vec<AttachmentRecord>,
}

/// Counts of active requests by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RequestStats {
    /// All active requests.
    pub total: u64,
    /// Active requests with status Pending.
    pub pending: u64,
    /// Active requests with status Completed.
    pub completed: u64,
    /// Active requests with status Rejected.
    pub rejected: u64,
}
