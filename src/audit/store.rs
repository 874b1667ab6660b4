//! Storage seam for the audit trail. The in-memory store backs the binary and
//! tests; a durable backend only needs to implement `AuditStore`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::entry::{AuditLogEntry, SecurityEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit store unavailable: {0}")]
pub struct StoreError(pub String);

pub trait AuditStore: Send + Sync {
    fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError>;
    fn append_security_event(&self, event: SecurityEvent) -> Result<(), StoreError>;
    /// All entries in insertion order.
    fn entries(&self) -> Result<Vec<AuditLogEntry>, StoreError>;
    fn security_events_since(&self, since: DateTime<Utc>) -> Result<Vec<SecurityEvent>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditLogEntry>>,
    events: RwLock<Vec<SecurityEvent>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self { Self::default() }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.entries.write().push(entry);
        Ok(())
    }

    fn append_security_event(&self, event: SecurityEvent) -> Result<(), StoreError> {
        self.events.write().push(event);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(self.entries.read().clone())
    }

    fn security_events_since(&self, since: DateTime<Utc>) -> Result<Vec<SecurityEvent>, StoreError> {
        Ok(self.events.read().iter().filter(|e| e.timestamp >= since).cloned().collect())
    }
}
