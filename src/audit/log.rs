//! Append-only audit trail with filtered queries and tamper-evident export.
//!
//! Entries are never mutated or removed here. Listing and export order is
//! `(timestamp, seq)`, so entries written in the same instant keep their
//! insertion order. An export returns the serialized payload together with a
//! SHA-256 hex digest of exactly those bytes, and the export itself is
//! written to the trail before the payload is handed out.

use std::cmp::Ordering as CmpOrdering;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{GateError, GateResult};

use super::entry::{actions, AuditLogEntry, AuditRecord};
use super::store::AuditStore;

pub const MAX_PAGE_SIZE: usize = 500;
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditFilter {
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring over the textual fields.
    #[serde(default)]
    pub search: Option<String>,
}

impl AuditFilter {
    pub fn matches(&self, e: &AuditLogEntry) -> bool {
        if let Some(a) = &self.actor_id { if &e.actor_id != a { return false; } }
        if let Some(a) = &self.action { if !e.action.eq_ignore_ascii_case(a) { return false; } }
        if let Some(r) = &self.resource_type { if !e.resource_type.eq_ignore_ascii_case(r) { return false; } }
        if let Some(from) = self.from { if e.timestamp < from { return false; } }
        if let Some(to) = self.to { if e.timestamp > to { return false; } }
        if let Some(needle) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = needle.to_lowercase();
            let hay = [
                Some(e.actor_id.as_str()),
                Some(e.action.as_str()),
                Some(e.resource_type.as_str()),
                e.resource_id.as_deref(),
                Some(e.change_description.as_str()),
                e.ip_address.as_deref(),
            ];
            if !hay.iter().flatten().any(|h| h.to_lowercase().contains(&needle)) { return false; }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Timestamp,
    Action,
    Actor,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub filter: AuditFilter,
    /// 1-based.
    pub page: usize,
    pub per_page: usize,
    pub sort_by: SortField,
    pub order: SortOrder,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            filter: AuditFilter::default(),
            page: 1,
            per_page: DEFAULT_PAGE_SIZE,
            sort_by: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditLogEntry>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv; charset=utf-8",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = GateError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(GateError::BadRequest(format!("unsupported export format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditExport {
    pub format: ExportFormat,
    pub payload: Vec<u8>,
    /// Lowercase hex SHA-256 of `payload`.
    pub integrity_hash: String,
    pub entry_count: usize,
    pub generated_at: DateTime<Utc>,
}

/// Who asked for an export; recorded as the export's own audit entry.
#[derive(Debug, Clone, Default)]
pub struct ExportRequester {
    pub actor_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    clock: SharedClock,
    next_seq: AtomicU64,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>, clock: SharedClock) -> Self {
        // Resume numbering after whatever the store already holds.
        let next = store
            .entries()
            .ok()
            .and_then(|v| v.iter().map(|e| e.seq + 1).max())
            .unwrap_or(0);
        Self { store, clock, next_seq: AtomicU64::new(next) }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> { &self.store }

    pub fn clock(&self) -> &SharedClock { &self.clock }

    /// Insert an entry. Storage failure is returned so mutating callers can abort.
    pub fn append(&self, record: AuditRecord) -> GateResult<AuditLogEntry> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            actor_id: record.actor_id,
            action: record.action,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            change_description: record.change_description,
            ip_address: record.ip_address,
            user_agent: record.user_agent,
            timestamp: self.clock.now(),
        };
        match self.store.append(entry.clone()) {
            Ok(()) => {
                info!(target: "coursegate::audit", actor = %entry.actor_id, action = %entry.action, seq = entry.seq, "audit.append");
                Ok(entry)
            }
            Err(e) => {
                error!(target: "coursegate::audit", action = %entry.action, "audit append failed: {}", e);
                Err(GateError::storage(e))
            }
        }
    }

    /// For read-only privileged calls: a failed write degrades to a warning.
    pub fn append_best_effort(&self, record: AuditRecord) -> Option<AuditLogEntry> {
        match self.append(record) {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(target: "coursegate::audit", "continuing without audit entry: {}", e);
                None
            }
        }
    }

    pub fn query(&self, q: &AuditQuery) -> GateResult<AuditPage> {
        let mut rows: Vec<AuditLogEntry> = self
            .store
            .entries()
            .map_err(|e| GateError::Internal(e.to_string()))?
            .into_iter()
            .filter(|e| q.filter.matches(e))
            .collect();
        rows.sort_by(|a, b| compare(a, b, q.sort_by, q.order));

        let per_page = q.per_page.clamp(1, MAX_PAGE_SIZE);
        let page = q.page.max(1);
        let total = rows.len();
        let entries = rows.into_iter().skip((page - 1).saturating_mul(per_page)).take(per_page).collect();
        Ok(AuditPage { entries, total, page, per_page })
    }

    pub fn export(&self, filter: &AuditFilter, format: ExportFormat, requester: &ExportRequester) -> GateResult<AuditExport> {
        let mut rows: Vec<AuditLogEntry> = self
            .store
            .entries()
            .map_err(|e| GateError::Internal(e.to_string()))?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        rows.sort_by(|a, b| compare(a, b, SortField::Timestamp, SortOrder::Asc));

        let payload = match format {
            ExportFormat::Json => serde_json::to_vec_pretty(&rows).map_err(|e| GateError::Internal(e.to_string()))?,
            ExportFormat::Csv => to_csv(&rows).into_bytes(),
        };
        let integrity_hash = integrity_hash(&payload);
        let filter_desc = serde_json::to_string(filter).unwrap_or_default();

        // The export is itself auditable; no trail entry, no export.
        self.append(
            AuditRecord::new(requester.actor_id.clone(), actions::EXPORT_AUDIT_LOG, "audit_log")
                .describe(format!(
                    "exported {} entries as {} sha256={} filters={}",
                    rows.len(),
                    format.as_str(),
                    integrity_hash,
                    filter_desc
                ))
                .origin(requester.ip_address.clone(), requester.user_agent.clone()),
        )?;

        Ok(AuditExport {
            format,
            entry_count: rows.len(),
            payload,
            integrity_hash,
            generated_at: self.clock.now(),
        })
    }
}

pub fn integrity_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Recompute the digest of `payload` and compare it with `expected_hex`.
pub fn verify_export(payload: &[u8], expected_hex: &str) -> bool {
    integrity_hash(payload).eq_ignore_ascii_case(expected_hex.trim())
}

fn compare(a: &AuditLogEntry, b: &AuditLogEntry, field: SortField, order: SortOrder) -> CmpOrdering {
    let primary = match field {
        SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortField::Action => a.action.cmp(&b.action).then(a.timestamp.cmp(&b.timestamp)),
        SortField::Actor => a.actor_id.cmp(&b.actor_id).then(a.timestamp.cmp(&b.timestamp)),
    };
    let ord = primary.then(a.seq.cmp(&b.seq));
    match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
    }
}

const CSV_HEADER: &str = "id,seq,timestamp,actor_id,action,resource_type,resource_id,change_description,ip_address,user_agent";

fn to_csv(rows: &[AuditLogEntry]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + rows.len() * 128);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for e in rows {
        let fields = [
            e.id.to_string(),
            e.seq.to_string(),
            e.timestamp.to_rfc3339(),
            e.actor_id.clone(),
            e.action.clone(),
            e.resource_type.clone(),
            e.resource_id.clone().unwrap_or_default(),
            e.change_description.clone(),
            e.ip_address.clone().unwrap_or_default(),
            e.user_agent.clone().unwrap_or_default(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
