//! Aggregate signals over the security-event stream. Read-only apart from
//! `record_event`, which is the single write path for security events.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{GateError, GateResult};

use super::entry::{AuditRecord, SecurityEvent, SecurityEventType, Severity};
use super::log::AuditLog;

#[derive(Debug, Clone, Copy)]
pub struct MonitorThresholds {
    /// Origin is suspicious once failures exceed this count.
    pub failure_threshold: u64,
    /// Ratio rule only applies from this many attempts.
    pub min_attempts_for_ratio: u64,
    pub failure_ratio: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self { Self { failure_threshold: 3, min_attempts_for_ratio: 5, failure_ratio: 0.5 } }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OriginStats {
    pub ip_address: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub failure_ratio: f64,
    pub suspicious: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoginAttemptSummary {
    pub period_days: u32,
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub per_origin: Vec<OriginStats>,
    pub suspicious_origins: Vec<String>,
}

const UNKNOWN_ORIGIN: &str = "unknown";

pub struct SecurityEventMonitor {
    log: Arc<AuditLog>,
    thresholds: MonitorThresholds,
}

impl SecurityEventMonitor {
    pub fn new(log: Arc<AuditLog>, thresholds: MonitorThresholds) -> Self { Self { log, thresholds } }

    pub fn now(&self) -> DateTime<Utc> { self.log.clock().now() }

    /// Mirror the event into the audit trail, then persist it. An event the
    /// trail refused is never stored, so it cannot count toward aggregates.
    pub fn record_event(&self, event: SecurityEvent) -> GateResult<()> {
        match event.severity {
            Severity::High => warn!(target: "coursegate::monitor", kind = event.event_type.as_str(), principal = ?event.principal_id, ip = ?event.ip_address, "security event"),
            _ => info!(target: "coursegate::monitor", kind = event.event_type.as_str(), principal = ?event.principal_id, ip = ?event.ip_address, "security event"),
        }
        let description = serde_json::json!({ "severity": event.severity, "details": event.details }).to_string();
        self.log.append(
            AuditRecord::new(
                event.principal_id.clone().unwrap_or_else(|| "anonymous".to_string()),
                event.event_type.as_str(),
                "security_event",
            )
            .describe(description)
            .origin(event.ip_address.clone(), event.user_agent.clone()),
        )?;
        self.log.store().append_security_event(event).map_err(GateError::storage)
    }

    /// Like `record_event` but never fails; used on paths that are already
    /// reporting a different error to the caller.
    pub fn record_best_effort(&self, event: SecurityEvent) {
        let kind = event.event_type;
        if let Err(e) = self.record_event(event) {
            warn!(target: "coursegate::monitor", kind = kind.as_str(), "dropped security event: {}", e);
        }
    }

    pub fn aggregate_login_attempts(&self, period_days: u32) -> GateResult<LoginAttemptSummary> {
        let now = self.now();
        let since = TimeDelta::try_days(i64::from(period_days))
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let events = self
            .log
            .store()
            .security_events_since(since)
            .map_err(|e| GateError::Internal(e.to_string()))?;

        let mut by_origin: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        let (mut successes, mut failures) = (0u64, 0u64);
        for ev in events.iter().filter(|e| e.event_type.is_login_attempt()) {
            let origin = ev.ip_address.clone().unwrap_or_else(|| UNKNOWN_ORIGIN.to_string());
            let slot = by_origin.entry(origin).or_default();
            if ev.event_type == SecurityEventType::FailedLogin {
                failures += 1;
                slot.1 += 1;
            } else {
                successes += 1;
                slot.0 += 1;
            }
        }

        let per_origin: Vec<OriginStats> = by_origin
            .into_iter()
            .map(|(ip, (ok, failed))| {
                let attempts = ok + failed;
                let ratio = if attempts == 0 { 0.0 } else { failed as f64 / attempts as f64 };
                OriginStats {
                    ip_address: ip,
                    attempts,
                    successes: ok,
                    failures: failed,
                    failure_ratio: ratio,
                    suspicious: self.is_suspicious(attempts, failed),
                }
            })
            .collect();
        let suspicious_origins = per_origin.iter().filter(|o| o.suspicious).map(|o| o.ip_address.clone()).collect();

        Ok(LoginAttemptSummary {
            period_days,
            total_attempts: successes + failures,
            success_count: successes,
            failure_count: failures,
            per_origin,
            suspicious_origins,
        })
    }

    fn is_suspicious(&self, attempts: u64, failures: u64) -> bool {
        let t = &self.thresholds;
        if failures > t.failure_threshold {
            return true;
        }
        attempts >= t.min_attempts_for_ratio && (failures as f64 / attempts as f64) > t.failure_ratio
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize, min_severity: Severity) -> GateResult<Vec<SecurityEvent>> {
        let mut events = self
            .log
            .store()
            .security_events_since(DateTime::<Utc>::MIN_UTC)
            .map_err(|e| GateError::Internal(e.to_string()))?;
        events.retain(|e| e.severity >= min_severity);
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }
}
