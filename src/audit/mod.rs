//! Accountability side of the gate: append-only trail, tamper-evident export
//! and security-event aggregation.

mod entry;
mod store;
mod log;
mod monitor;

pub use entry::{actions, AuditLogEntry, AuditRecord, SecurityEvent, SecurityEventType, Severity};
pub use store::{AuditStore, MemoryAuditStore, StoreError};
pub use log::{
    integrity_hash, verify_export, AuditExport, AuditFilter, AuditLog, AuditPage, AuditQuery, ExportFormat,
    ExportRequester, SortField, SortOrder, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use monitor::{LoginAttemptSummary, MonitorThresholds, OriginStats, SecurityEventMonitor};
