//! Upstream feed reconciliation.
//!
//! The upstream system is the source of record for newly submitted requests;
//! this module pulls its feed opportunistically (listing triggers a pull) and
//! upserts each record into the local store, keyed by the feed's own
//! identifier. The feed is lenient territory: missing fields default, flag
//! fields arrive as booleans or integers, the uploaded-file list arrives as a
//! JSON-encoded string, and one malformed record never aborts the batch. A
//! transport or parse failure downgrades the whole pull to a logged no-op so
//! lists keep serving local data.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::request::{AuthorizedPersonSpec, ImportedRequest};
use crate::store::{self, RequestStore, StoreError};

/// Errors from the importer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImportError {
    /// The feed could not be fetched or its top level was not an array.
    #[error("upstream feed fetch failed: {0}")]
    Feed(String),

    /// Local persistence failure while applying the batch.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome counts for one sync pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportReport {
    /// Records received from the feed.
    pub fetched: usize,
    /// Records that created a new local row.
    pub created: usize,
    /// Records that updated an existing row.
    pub updated: usize,
    /// Records dropped as unparseable.
    pub skipped: usize,
}

/// The upstream feed of candidate requests.
pub trait UpstreamFeed: Send + Sync {
    /// Fetches one batch of candidate records.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Feed`] on transport or top-level parse
    /// failure; the caller logs it and syncs nothing.
    fn fetch(&self) -> Result<Vec<Value>, ImportError>;
}

/// Reconciles the upstream feed into the local store.
pub struct SyncImporter {
    store: RequestStore,
    feed: Box<dyn UpstreamFeed>,
}

impl SyncImporter {
    /// Creates an importer pulling from the given feed.
    #[must_use]
    pub fn new(store: RequestStore, feed: Box<dyn UpstreamFeed>) -> Self {
        Self { store, feed }
    }

    /// Runs one sync pass.
    ///
    /// An unreachable or unparseable feed is a logged no-op. Malformed
    /// individual records are counted as skipped. The whole batch applies in
    /// one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error only on local persistence failure; the batch rolls
    /// back in that case.
    pub fn sync(&self) -> Result<ImportReport, ImportError> {
        let batch = match self.feed.fetch() {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "upstream feed unavailable, serving local data only");
                return Ok(ImportReport::default());
            }
        };

        let mut report = ImportReport::default();
        let mut conn = self.store.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        for value in batch {
            report.fetched += 1;
            let record: FeedRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping unparseable feed record");
                    report.skipped += 1;
                    continue;
                }
            };
            if record.id <= 0 {
                warn!(id = record.id, "skipping feed record without a usable id");
                report.skipped += 1;
                continue;
            }

            let imported = record.into_imported();
            let created = store::upsert_imported(&tx, &imported)?;
            store::replace_persons(&tx, imported.id, &imported.authorized_persons)?;
            if created {
                debug!(request_id = imported.id, "imported new request");
                report.created += 1;
            } else {
                report.updated += 1;
            }
        }

        tx.commit().map_err(StoreError::from)?;
        info!(
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            "upstream sync finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for SyncImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncImporter").finish_non_exhaustive()
    }
}

/// One raw feed record. Every field except `id` is optional and lenient.
#[derive(Debug, Deserialize)]
struct FeedRecord {
    #[serde(default)]
    id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    company_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    address: String,
    #[serde(default, deserialize_with = "lenient_string")]
    city: String,
    #[serde(default, deserialize_with = "lenient_string")]
    state: String,
    #[serde(default, deserialize_with = "lenient_string")]
    phone: String,
    #[serde(default, deserialize_with = "lenient_string")]
    email: String,
    #[serde(default, deserialize_with = "lenient_string")]
    tax_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    contact_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    contact_position: String,
    #[serde(default, deserialize_with = "lenient_string")]
    contact_phone: String,
    #[serde(default, deserialize_with = "lenient_string")]
    contact_email: String,
    #[serde(default, deserialize_with = "lenient_string")]
    ip_address: String,
    #[serde(default, deserialize_with = "lenient_string")]
    created_at: String,
    /// The feed double-encodes this list as a JSON string.
    #[serde(default)]
    uploaded_files: Value,
    #[serde(default)]
    authorized_persons: Vec<FeedPerson>,
}

impl FeedRecord {
    fn into_imported(self) -> ImportedRequest {
        ImportedRequest {
            id: self.id,
            company_name: self.company_name,
            address: self.address,
            city: self.city,
            state: self.state,
            phone: self.phone,
            email: self.email,
            tax_id: self.tax_id,
            contact_name: self.contact_name,
            contact_position: self.contact_position,
            contact_phone: self.contact_phone,
            contact_email: self.contact_email,
            created_at: parse_feed_timestamp(&self.created_at),
            created_from_ip: if self.ip_address.is_empty() {
                None
            } else {
                Some(self.ip_address)
            },
            uploaded_files: decode_file_list(&self.uploaded_files),
            authorized_persons: self
                .authorized_persons
                .into_iter()
                .map(FeedPerson::into_spec)
                .collect(),
        }
    }
}

/// One nested authorized-person object. All fields default.
#[derive(Debug, Deserialize)]
struct FeedPerson {
    #[serde(default, deserialize_with = "lenient_string")]
    name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    position: String,
    #[serde(default, deserialize_with = "lenient_string")]
    phone: String,
    #[serde(default, deserialize_with = "lenient_string")]
    email: String,
    #[serde(default, deserialize_with = "lenient_flag")]
    informational: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    operational: bool,
    #[serde(default, deserialize_with = "lenient_string")]
    associated_with: String,
}

impl FeedPerson {
    fn into_spec(self) -> AuthorizedPersonSpec {
        AuthorizedPersonSpec {
            name: self.name,
            position: self.position,
            phone: self.phone,
            email: if self.email.is_empty() {
                None
            } else {
                Some(self.email)
            },
            informational: self.informational,
            operational: self.operational,
            associated_with: self.associated_with,
        }
    }
}

/// Accepts a string, number, or null where a string is expected.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Accepts a bool, an integer, or the strings "1"/"true" as a flag.
fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// Decodes the uploaded-files field, which arrives either as a JSON-encoded
/// string or as a plain array. Anything malformed degrades to empty.
fn decode_file_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(inner) => serde_json::from_str(inner).unwrap_or_default(),
        Value::Array(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Parses the feed's timestamp formats; anything unparseable becomes `None`
/// (the upsert then stamps the current time).
fn parse_feed_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc());
        }
    }
    warn!(raw, "unparseable feed timestamp");
    None
}

// =============================================================================
// HTTP-backed feed
// =============================================================================

/// A feed client issuing one GET per pull.
pub struct HttpFeed {
    url: String,
    timeout: Duration,
}

impl HttpFeed {
    /// Creates a client for the configured feed URL.
    #[must_use]
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.feed_url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl std::fmt::Debug for HttpFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFeed").field("url", &self.url).finish_non_exhaustive()
    }
}

impl UpstreamFeed for HttpFeed {
    fn fetch(&self) -> Result<Vec<Value>, ImportError> {
        if self.url.is_empty() {
            return Err(ImportError::Feed("no feed url configured".to_string()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ImportError::Feed(e.to_string()))?;
        let body: Value = client
            .get(&self.url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .and_then(reqwest::blocking::Response::json)
            .map_err(|e| ImportError::Feed(e.to_string()))?;
        match body {
            Value::Array(records) => Ok(records),
            _ => Err(ImportError::Feed(
                "expected a record array at the feed top level".to_string(),
            )),
        }
    }
}
