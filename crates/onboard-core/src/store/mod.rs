//! `SQLite`-backed persistence for onboarding requests.
//!
//! The [`RequestStore`] owns the connection (WAL mode, mutex-guarded) and
//! provides the read API. Mutating operations run inside transactions opened
//! by the lifecycle engine; the row-level helpers in this module take a
//! plain [`Connection`] reference so they compose into those transactions.

// SQLite returns i64 for row IDs and counts, but they're always non-negative
// where cast. Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(clippy::cast_sign_loss)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use thiserror::Error;

use crate::audit;
use crate::request::{
    AttachmentRecord, AuthorizedPerson, AuthorizedPersonSpec, ImportedRequest, ListFilter,
    NewRequest, RequestDetail, RequestRecord, RequestStats, RequestStatus,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON encoding of a list column failed.
    #[error("column encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// No request with the given id.
    #[error("request not found: id={id}")]
    NotFound {
        /// The id that was looked up.
        id: i64,
    },

    /// The customer-code uniqueness constraint was violated at write time.
    #[error("customer code already in use: '{code}'")]
    DuplicateCustomerCode {
        /// The conflicting code.
        code: String,
    },
}

/// The store: a mutex-guarded `SQLite` connection plus the read API.
#[derive(Clone)]
pub struct RequestStore {
    conn: Arc<Mutex<Connection>>,
}

impl RequestStore {
    /// Opens or creates the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the underlying connection. One logical transaction per caller;
    /// the lock serializes writers.
    #[allow(clippy::missing_panics_doc)]
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Fetches a request with its persons, history, and attachments.
    ///
    /// Soft-deleted requests are still returned; only lists hide them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id does not exist.
    pub fn get(&self, id: i64) -> Result<RequestDetail, StoreError> {
        let conn = self.lock();
        load_detail(&conn, id)
    }

    /// Lists active requests matching the filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<RequestRecord>, StoreError> {
        let conn = self.lock();

        let mut sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE active = 1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(company) = &filter.company_name {
            sql.push_str(" AND LOWER(company_name) LIKE '%' || LOWER(?) || '%'");
            binds.push(company.clone());
        }
        if let Some(email) = &filter.email {
            sql.push_str(" AND LOWER(email) LIKE '%' || LOWER(?) || '%'");
            binds.push(email.clone());
        }
        if let Some(role) = &filter.role {
            sql.push_str(" AND LOWER(roles) LIKE '%' || LOWER(?) || '%'");
            binds.push(role.clone());
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(binds.iter()), row_to_request)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Counts active requests by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<RequestStats, StoreError> {
        let conn = self.lock();
        let (total, pending, completed, rejected) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'Pending'),
                    COUNT(*) FILTER (WHERE status = 'Completed'),
                    COUNT(*) FILTER (WHERE status = 'Rejected')
             FROM requests WHERE active = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        Ok(RequestStats {
            total: total as u64,
            pending: pending as u64,
            completed: completed as u64,
            rejected: rejected as u64,
        })
    }
}

impl std::fmt::Debug for RequestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestStore").finish_non_exhaustive()
    }
}

/// Column list for request SELECTs; must match [`row_to_request`].
const REQUEST_COLUMNS: &str = "id, company_name, address, city, state, phone, email, tax_id, \
     contact_name, contact_position, contact_phone, contact_email, customer_code, roles, notes, \
     rejection_notes, status, active, created_by, created_at, created_from_ip, uploaded_files";

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let roles_json: String = row.get(13)?;
    let status_text: String = row.get(16)?;
    let files_json: String = row.get(21)?;
    Ok(RequestRecord {
        id: row.get(0)?,
        company_name: row.get(1)?,
        address: row.get(2)?,
        city: row.get(3)?,
        state: row.get(4)?,
        phone: row.get(5)?,
        email: row.get(6)?,
        tax_id: row.get(7)?,
        contact_name: row.get(8)?,
        contact_position: row.get(9)?,
        contact_phone: row.get(10)?,
        contact_email: row.get(11)?,
        customer_code: row.get(12)?,
        // Malformed stored JSON degrades to an empty list rather than
        // failing the read.
        roles: serde_json::from_str(&roles_json).unwrap_or_default(),
        notes: row.get(14)?,
        rejection_notes: row.get(15)?,
        status: RequestStatus::parse(&status_text).unwrap_or(RequestStatus::Pending),
        active: row.get::<_, i64>(17)? != 0,
        created_by: row.get(18)?,
        created_at: from_unix(row.get(19)?),
        created_from_ip: row.get(20)?,
        uploaded_files: serde_json::from_str(&files_json).unwrap_or_default(),
    })
}

/// Converts a stored unix-seconds timestamp back to a `DateTime`.
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Maps a constraint violation on `customer_code` to the domain error.
fn map_write_err(err: rusqlite::Error, code: Option<&str>) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, Some(msg)) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains("customer_code") {
            return StoreError::DuplicateCustomerCode {
                code: code.unwrap_or_default().to_string(),
            };
        }
    }
    StoreError::Database(err)
}

/// Inserts a new request row. Returns the assigned id.
pub(crate) fn insert_request(
    conn: &Connection,
    new: &NewRequest,
    created_by: Option<&str>,
    created_from_ip: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let customer_code = normalize_code(new.customer_code.as_deref());
    let roles = serde_json::to_string(&new.roles)?;
    let uploaded_files = serde_json::to_string(&new.uploaded_files)?;
    conn.execute(
        "INSERT INTO requests (company_name, address, city, state, phone, email, tax_id,
            contact_name, contact_position, contact_phone, contact_email, customer_code,
            roles, notes, status, created_by, created_at, created_from_ip, uploaded_files)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            new.company_name,
            new.address,
            new.city,
            new.state,
            new.phone,
            new.email,
            new.tax_id,
            new.contact_name,
            new.contact_position,
            new.contact_phone,
            new.contact_email,
            customer_code,
            roles,
            new.notes,
            RequestStatus::Pending.as_str(),
            created_by,
            created_at.timestamp(),
            created_from_ip,
            uploaded_files,
        ],
    )
    .map_err(|e| map_write_err(e, customer_code.as_deref()))?;
    Ok(conn.last_insert_rowid())
}

/// Upserts an imported request under the feed's identifier. Overwrites only
/// the submission columns and reactivates the row; status, customer code,
/// notes, and attribution columns survive the upsert. Returns `true` if the
/// row was created.
pub(crate) fn upsert_imported(
    conn: &Connection,
    imported: &ImportedRequest,
) -> Result<bool, StoreError> {
    let existed = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM requests WHERE id = ?1)",
        params![imported.id],
        |row| row.get::<_, i64>(0),
    )? != 0;
    let uploaded_files = serde_json::to_string(&imported.uploaded_files)?;
    let created_at = imported.created_at.unwrap_or_else(Utc::now).timestamp();
    conn.execute(
        "INSERT INTO requests (id, company_name, address, city, state, phone, email, tax_id,
            contact_name, contact_position, contact_phone, contact_email,
            created_at, created_from_ip, uploaded_files)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT (id) DO UPDATE SET
            company_name = excluded.company_name,
            address = excluded.address,
            city = excluded.city,
            state = excluded.state,
            phone = excluded.phone,
            email = excluded.email,
            tax_id = excluded.tax_id,
            contact_name = excluded.contact_name,
            contact_position = excluded.contact_position,
            contact_phone = excluded.contact_phone,
            contact_email = excluded.contact_email,
            created_at = excluded.created_at,
            created_from_ip = excluded.created_from_ip,
            uploaded_files = excluded.uploaded_files,
            active = 1",
        params![
            imported.id,
            imported.company_name,
            imported.address,
            imported.city,
            imported.state,
            imported.phone,
            imported.email,
            imported.tax_id,
            imported.contact_name,
            imported.contact_position,
            imported.contact_phone,
            imported.contact_email,
            created_at,
            imported.created_from_ip,
            uploaded_files,
        ],
    )?;
    Ok(!existed)
}

/// Fetches a single request row by id.
pub(crate) fn fetch_request(conn: &Connection, id: i64) -> Result<RequestRecord, StoreError> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1");
    conn.query_row(&sql, params![id], row_to_request)
        .optional()?
        .ok_or(StoreError::NotFound { id })
}

/// Writes back every mutable column of a request row.
pub(crate) fn save_request(conn: &Connection, record: &RequestRecord) -> Result<(), StoreError> {
    let roles = serde_json::to_string(&record.roles)?;
    let uploaded_files = serde_json::to_string(&record.uploaded_files)?;
    let updated = conn
        .execute(
            "UPDATE requests SET company_name = ?1, address = ?2, city = ?3, state = ?4,
                phone = ?5, email = ?6, tax_id = ?7, contact_name = ?8, contact_position = ?9,
                contact_phone = ?10, contact_email = ?11, customer_code = ?12, roles = ?13,
                notes = ?14, rejection_notes = ?15, status = ?16, active = ?17,
                uploaded_files = ?18
             WHERE id = ?19",
            params![
                record.company_name,
                record.address,
                record.city,
                record.state,
                record.phone,
                record.email,
                record.tax_id,
                record.contact_name,
                record.contact_position,
                record.contact_phone,
                record.contact_email,
                record.customer_code,
                roles,
                record.notes,
                record.rejection_notes,
                record.status.as_str(),
                i64::from(record.active),
                uploaded_files,
                record.id,
            ],
        )
        .map_err(|e| map_write_err(e, record.customer_code.as_deref()))?;
    if updated == 0 {
        return Err(StoreError::NotFound { id: record.id });
    }
    Ok(())
}

/// Deletes all authorized persons for a request and inserts the
/// replacements. Full replace, never a diff.
pub(crate) fn replace_persons(
    conn: &Connection,
    request_id: i64,
    specs: &[AuthorizedPersonSpec],
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM authorized_persons WHERE request_id = ?1",
        params![request_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO authorized_persons
            (request_id, name, position, phone, email, informational, operational, associated_with)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for spec in specs {
        stmt.execute(params![
            request_id,
            spec.name,
            spec.position,
            spec.phone,
            spec.email,
            i64::from(spec.informational),
            i64::from(spec.operational),
            spec.associated_with,
        ])?;
    }
    Ok(())
}

/// Reads the authorized persons for a request, in insertion order.
pub(crate) fn persons_for(
    conn: &Connection,
    request_id: i64,
) -> Result<Vec<AuthorizedPerson>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, request_id, name, position, phone, email, informational, operational,
                associated_with
         FROM authorized_persons WHERE request_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![request_id], |row| {
            Ok(AuthorizedPerson {
                id: row.get(0)?,
                request_id: row.get(1)?,
                name: row.get(2)?,
                position: row.get(3)?,
                phone: row.get(4)?,
                email: row.get(5)?,
                informational: row.get::<_, i64>(6)? != 0,
                operational: row.get::<_, i64>(7)? != 0,
                associated_with: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Inserts an attachment row. Returns the assigned id.
pub(crate) fn insert_attachment(
    conn: &Connection,
    request_id: i64,
    file_ref: &str,
    original_filename: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO attachments (request_id, file_ref, original_filename) VALUES (?1, ?2, ?3)",
        params![request_id, file_ref, original_filename],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Fetches an attachment scoped to its owning request, if present.
pub(crate) fn fetch_attachment(
    conn: &Connection,
    attachment_id: i64,
    request_id: i64,
) -> Result<Option<AttachmentRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, request_id, file_ref, original_filename
             FROM attachments WHERE id = ?1 AND request_id = ?2",
            params![attachment_id, request_id],
            |row| {
                Ok(AttachmentRecord {
                    id: row.get(0)?,
                    request_id: row.get(1)?,
                    file_ref: row.get(2)?,
                    original_filename: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Deletes an attachment row. The caller must have removed the stored bytes
/// first.
pub(crate) fn delete_attachment_row(
    conn: &Connection,
    attachment_id: i64,
) -> Result<(), StoreError> {
    conn.execute("DELETE FROM attachments WHERE id = ?1", params![attachment_id])?;
    Ok(())
}

/// Reads the attachments for a request, in insertion order.
pub(crate) fn attachments_for(
    conn: &Connection,
    request_id: i64,
) -> Result<Vec<AttachmentRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, request_id, file_ref, original_filename
         FROM attachments WHERE request_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![request_id], |row| {
            Ok(AttachmentRecord {
                id: row.get(0)?,
                request_id: row.get(1)?,
                file_ref: row.get(2)?,
                original_filename: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Loads a request with all owned rows.
pub(crate) fn load_detail(conn: &Connection, id: i64) -> Result<RequestDetail, StoreError> {
    let request = fetch_request(conn, id)?;
    let authorized_persons = persons_for(conn, id)?;
    let history = audit::entries_for(conn, id)?;
    let attachments = attachments_for(conn, id)?;
    Ok(RequestDetail {
        request,
        authorized_persons,
        history,
        attachments,
    })
}

/// Treats an empty or whitespace-only code as unassigned.
pub(crate) fn normalize_code(code: Option<&str>) -> Option<String> {
    match code {
        Some(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        None => None,
    }
}
