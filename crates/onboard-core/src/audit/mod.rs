//! Append-only per-request audit history.
//!
//! One entry per mutating operation that actually changed state. There is no
//! update or delete surface; read access is always via the owning request,
//! newest first.

use chrono::Utc;
use rusqlite::{Connection, params};

use crate::request::HistoryEntry;
use crate::store::{StoreError, from_unix};

/// Who performed a mutation and from where.
///
/// Both fields are optional: anonymous submissions carry no username, and
/// system-initiated changes (e.g. the upstream importer) carry neither.
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    /// Acting username, if authenticated.
    pub username: Option<String>,
    /// Source address of the call, if known.
    pub source_ip: Option<String>,
}

impl ActorContext {
    /// An actor context for system-initiated changes.
    #[must_use]
    pub const fn system() -> Self {
        Self {
            username: None,
            source_ip: None,
        }
    }
}

/// Appends one history entry. The timestamp is assigned here, at write time.
pub(crate) fn append(
    conn: &Connection,
    request_id: i64,
    actor: &ActorContext,
    action: &str,
) -> Result<(), StoreError> {
    debug_assert!(!action.is_empty());
    conn.execute(
        "INSERT INTO request_history (request_id, actor, source_ip, action, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            request_id,
            actor.username,
            actor.source_ip,
            action,
            Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

/// Reads the history for a request, newest first.
pub(crate) fn entries_for(
    conn: &Connection,
    request_id: i64,
) -> Result<Vec<HistoryEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, request_id, actor, source_ip, action, changed_at
         FROM request_history WHERE request_id = ?1 ORDER BY changed_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![request_id], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                request_id: row.get(1)?,
                actor: row.get(2)?,
                source_ip: row.get(3)?,
                action: row.get(4)?,
                changed_at: from_unix(row.get(5)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::request::NewRequest;
    use crate::store::{RequestStore, insert_request};

    #[test]
    fn entries_come_back_newest_first() {
        let store = RequestStore::in_memory().unwrap();
        let conn = store.lock();
        let new = NewRequest {
            company_name: "Acme".to_string(),
            ..NewRequest::default()
        };
        let id = insert_request(&conn, &new, None, None, Utc::now()).unwrap();

        let actor = ActorContext {
            username: Some("staff".to_string()),
            source_ip: Some("10.0.0.1".to_string()),
        };
        append(&conn, id, &actor, "Request created.").unwrap();
        append(&conn, id, &actor, "notes changed from '' to 'hi'.").unwrap();

        let entries = entries_for(&conn, id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "notes changed from '' to 'hi'.");
        assert_eq!(entries[1].action, "Request created.");
        assert_eq!(entries[0].actor.as_deref(), Some("staff"));
    }

    #[test]
    fn system_actor_has_no_identity() {
        let actor = ActorContext::system();
        assert!(actor.username.is_none());
        assert!(actor.source_ip.is_none());
    }
}
