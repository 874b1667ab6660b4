//! Live registry of privileged sessions.
//!
//! A privileged token is only honoured while its session id is present here
//! for the same principal and has not been idle past the timeout. The whole
//! map sits behind one `RwLock`; mutations take the write lock, `list` clones
//! under the read lock so callers never see a half-updated record.
//!
//! `activate` performs the liveness check and the touch under the same write
//! lock. `sweep` reads "now" once and compares every entry against it under
//! the lock it deletes with, so a touch that landed before the cutoff always
//! survives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audit::{SecurityEvent, SecurityEventMonitor, SecurityEventType, Severity};
use crate::clock::{elapsed_between, SharedClock};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub principal_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub session_id: String,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining_secs: u64,
    /// Remaining time is at or below the warning threshold.
    pub warning: bool,
}

pub struct SessionRegistry {
    clock: SharedClock,
    idle_timeout: Duration,
    warning_threshold: Duration,
    entries: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new(clock: SharedClock, idle_timeout: Duration, warning_threshold: Duration) -> Self {
        Self { clock, idle_timeout, warning_threshold, entries: RwLock::new(HashMap::new()) }
    }

    pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

    /// Insert or replace the entry for `session_id`.
    pub fn create(&self, principal_id: &str, session_id: &str) -> SessionRecord {
        let now = self.clock.now();
        let rec = SessionRecord {
            session_id: session_id.to_string(),
            principal_id: principal_id.to_string(),
            created_at: now,
            last_activity: now,
        };
        self.entries.write().insert(session_id.to_string(), rec.clone());
        info!(target: "coursegate::session", principal = principal_id, sid = session_id, "session.create");
        rec
    }

    /// Refresh last activity. Absent ids are ignored; this is not an existence check.
    pub fn touch(&self, session_id: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let mut map = self.entries.write();
        let rec = map.get_mut(session_id)?;
        rec.last_activity = rec.last_activity.max(now);
        Some(rec.last_activity)
    }

    /// Liveness check plus touch in one critical section. Returns the
    /// refreshed record only if the session exists, belongs to
    /// `principal_id` and has not been idle past the timeout.
    pub fn activate(&self, session_id: &str, principal_id: &str) -> Option<SessionRecord> {
        let now = self.clock.now();
        let mut map = self.entries.write();
        let rec = map.get_mut(session_id)?;
        if rec.principal_id != principal_id {
            return None;
        }
        if elapsed_between(rec.last_activity, now) > self.idle_timeout {
            return None;
        }
        rec.last_activity = rec.last_activity.max(now);
        Some(rec.clone())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.entries.read().get(session_id).cloned()
    }

    /// Idempotent; returns whether an entry was removed.
    pub fn destroy(&self, session_id: &str) -> bool {
        let removed = self.entries.write().remove(session_id).is_some();
        if removed {
            info!(target: "coursegate::session", sid = session_id, "session.destroy");
        }
        removed
    }

    /// Snapshot copy, most recently active first.
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut out: Vec<SessionRecord> = self.entries.read().values().cloned().collect();
        out.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then_with(|| a.session_id.cmp(&b.session_id)));
        out
    }

    pub fn len(&self) -> usize { self.entries.read().len() }

    pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }

    /// Evict every entry idle for strictly longer than `idle_timeout` at `now`.
    pub fn sweep(&self, idle_timeout: Duration, now: DateTime<Utc>) -> Vec<SessionRecord> {
        let mut map = self.entries.write();
        let stale: Vec<String> = map
            .values()
            .filter(|r| elapsed_between(r.last_activity, now) > idle_timeout)
            .map(|r| r.session_id.clone())
            .collect();
        let evicted: Vec<SessionRecord> = stale.iter().filter_map(|k| map.remove(k)).collect();
        drop(map);
        for r in &evicted {
            info!(target: "coursegate::session", principal = %r.principal_id, sid = %r.session_id, "session.evicted");
        }
        evicted
    }

    /// `sweep` with the registry's own clock and timeout.
    pub fn sweep_expired(&self) -> Vec<SessionRecord> {
        self.sweep(self.idle_timeout, self.clock.now())
    }

    /// Administrative termination. Returns whether the session existed.
    pub fn force_logout(&self, session_id: &str, actor_id: &str) -> bool {
        let removed = self.entries.write().remove(session_id);
        match &removed {
            Some(r) => info!(target: "coursegate::session", actor = actor_id, principal = %r.principal_id, sid = session_id, "session.force_logout"),
            None => debug!(target: "coursegate::session", actor = actor_id, sid = session_id, "session.force_logout: unknown session"),
        }
        removed.is_some()
    }

    /// Time left on the session. The session ends at whichever comes first:
    /// the idle cutoff or `token_expires_at`, the hard expiry of the token
    /// presenting it.
    pub fn status(&self, session_id: &str, token_expires_at: Option<DateTime<Utc>>) -> Option<SessionStatus> {
        let rec = self.get(session_id)?;
        let now = self.clock.now();
        let idle = TimeDelta::from_std(self.idle_timeout).unwrap_or(TimeDelta::MAX);
        let idle_cutoff = rec.last_activity.checked_add_signed(idle).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let expires_at = token_expires_at.map_or(idle_cutoff, |t| t.min(idle_cutoff));
        let remaining = elapsed_between(now, expires_at);
        Some(SessionStatus {
            session_id: rec.session_id,
            last_activity: rec.last_activity,
            expires_at,
            remaining_secs: remaining.as_secs(),
            warning: remaining <= self.warning_threshold,
        })
    }
}

/// Handle for the background sweep task. Dropping it leaves the task running;
/// call `stop` at shutdown.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

/// Run `sweep_expired` every `interval` until stopped. Evictions are reported
/// to the monitor as low-severity `session_expired` events when one is given.
pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    monitor: Option<Arc<SecurityEventMonitor>>,
) -> SweeperHandle {
    let (tx, mut rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = ticker.tick() => {
                    let evicted = registry.sweep_expired();
                    if !evicted.is_empty() {
                        debug!(target: "coursegate::session", removed = evicted.len(), "session_sweep");
                    }
                    if let Some(m) = &monitor {
                        for r in evicted {
                            m.record_best_effort(
                                SecurityEvent::new(SecurityEventType::SessionExpired, Severity::Low, registry.now())
                                    .principal(r.principal_id)
                                    .details(serde_json::json!({ "session_id": r.session_id, "last_activity": r.last_activity })),
                            );
                        }
                    }
                }
            }
        }
        debug!(target: "coursegate::session", "session sweeper stopped");
    });
    SweeperHandle { shutdown: Some(tx), join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    const FOUR_HOURS: Duration = Duration::from_secs(4 * 3600);

    fn registry() -> (SessionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (SessionRegistry::new(clock.clone(), FOUR_HOURS, Duration::from_secs(900)), clock)
    }

    #[test]
    fn create_overwrites_same_key() {
        let (r, _) = registry();
        r.create("alice", "s1");
        r.create("bob", "s1");
        assert_eq!(r.len(), 1);
        assert_eq!(r.get("s1").unwrap().principal_id, "bob");
    }

    #[test]
    fn touch_absent_is_noop() {
        let (r, _) = registry();
        assert!(r.touch("ghost").is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn touch_never_moves_backwards() {
        let (r, clock) = registry();
        r.create("alice", "s1");
        clock.advance(Duration::from_secs(30));
        let t1 = r.touch("s1").unwrap();
        clock.set(t1 - TimeDelta::seconds(10));
        let t2 = r.touch("s1").unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (r, _) = registry();
        r.create("alice", "s1");
        assert!(r.destroy("s1"));
        assert!(!r.destroy("s1"));
    }

    #[test]
    fn activate_binds_session_to_principal() {
        let (r, _) = registry();
        r.create("alice", "s1");
        assert!(r.activate("s1", "mallory").is_none());
        assert!(r.activate("s2", "alice").is_none());
        assert_eq!(r.activate("s1", "alice").unwrap().principal_id, "alice");
    }

    #[test]
    fn activate_rejects_idle_session_before_sweep() {
        let (r, clock) = registry();
        r.create("alice", "s1");
        clock.advance(FOUR_HOURS + Duration::from_secs(1));
        assert!(r.activate("s1", "alice").is_none());
    }

    #[test]
    fn sweep_boundary_is_strict() {
        let (r, clock) = registry();
        let t0 = clock.now();
        r.create("alice", "s1");
        let at_limit = t0 + TimeDelta::from_std(FOUR_HOURS).unwrap();
        assert!(r.sweep(FOUR_HOURS, at_limit).is_empty());
        let evicted = r.sweep(FOUR_HOURS, at_limit + TimeDelta::seconds(1));
        assert_eq!(evicted.len(), 1);
        assert!(r.list().is_empty());
    }

    #[test]
    fn force_logout_reports_existence() {
        let (r, _) = registry();
        r.create("alice", "s1");
        assert!(r.force_logout("s1", "root"));
        assert!(!r.force_logout("s1", "root"));
    }

    #[test]
    fn status_warns_near_expiry() {
        let (r, clock) = registry();
        r.create("alice", "s1");
        let s = r.status("s1", None).unwrap();
        assert_eq!(s.remaining_secs, 4 * 3600);
        assert!(!s.warning);
        clock.advance(FOUR_HOURS - Duration::from_secs(900));
        let s = r.status("s1", None).unwrap();
        assert_eq!(s.remaining_secs, 900);
        assert!(s.warning);
    }

    #[test]
    fn status_is_capped_by_token_expiry() {
        let (r, clock) = registry();
        let t0 = clock.now();
        r.create("alice", "s1");
        let token_exp = t0 + TimeDelta::from_std(FOUR_HOURS).unwrap();
        clock.advance(FOUR_HOURS - Duration::from_secs(600));
        // activity resets the idle cutoff but not the token's own expiry
        r.activate("s1", "alice").unwrap();
        let s = r.status("s1", Some(token_exp)).unwrap();
        assert_eq!(s.expires_at, token_exp);
        assert_eq!(s.remaining_secs, 600);
        assert!(s.warning);
        assert!(!r.status("s1", None).unwrap().warning);
    }

    #[test]
    fn list_is_a_snapshot() {
        let (r, _) = registry();
        r.create("alice", "s1");
        let snap = r.list();
        r.destroy("s1");
        assert_eq!(snap.len(), 1);
        assert!(r.list().is_empty());
    }

    #[tokio::test]
    async fn sweeper_task_evicts_and_stops() {
        let clock = Arc::new(ManualClock::default());
        let reg = Arc::new(SessionRegistry::new(clock.clone(), FOUR_HOURS, Duration::from_secs(900)));
        reg.create("alice", "s1");
        clock.advance(FOUR_HOURS + Duration::from_secs(5));
        let handle = spawn_sweeper(reg.clone(), Duration::from_millis(10), None);
        for _ in 0..100 {
            if reg.is_empty() { break; }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reg.is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn sweeper_reports_each_eviction() {
        use crate::audit::{AuditLog, MemoryAuditStore, MonitorThresholds};

        let clock = Arc::new(ManualClock::default());
        let reg = Arc::new(SessionRegistry::new(clock.clone(), FOUR_HOURS, Duration::from_secs(900)));
        let log = Arc::new(AuditLog::new(Arc::new(MemoryAuditStore::new()), clock.clone()));
        let monitor = Arc::new(SecurityEventMonitor::new(log, MonitorThresholds::default()));
        reg.create("alice", "s1");
        reg.create("bob", "s2");
        clock.advance(FOUR_HOURS + Duration::from_secs(5));
        reg.create("carol", "s3");

        let handle = spawn_sweeper(reg.clone(), Duration::from_millis(10), Some(monitor.clone()));
        let mut events = Vec::new();
        for _ in 0..100 {
            events = monitor.recent_events(10, Severity::Low).unwrap();
            if events.len() >= 2 { break; }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == SecurityEventType::SessionExpired));
        let mut who: Vec<_> = events.iter().filter_map(|e| e.principal_id.clone()).collect();
        who.sort();
        assert_eq!(who, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(reg.list().len(), 1);
    }
}
