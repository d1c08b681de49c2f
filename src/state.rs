//! Warm-slot and session registries.
//!
//! Both tables live in one [`Registry`] so that moving a sandbox from warm to
//! claimed happens under a single lock acquisition. Nothing in here performs
//! I/O; the façade in [`crate::pool`] owns the lock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::provisioner::SandboxHandle;

/// A provisioned, unclaimed sandbox.
#[derive(Debug, Clone)]
pub struct WarmSandbox {
    pub handle: SandboxHandle,
    pub created_at: Instant,
    pub healthy: bool,
    pub last_health_check: Instant,
}

impl WarmSandbox {
    pub fn new(handle: SandboxHandle, now: Instant) -> Self {
        Self {
            handle,
            created_at: now,
            healthy: true,
            last_health_check: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Expired,
    Released,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Released => "released",
        }
    }
}

/// A bounded lease on a claimed sandbox.
#[derive(Debug, Clone)]
pub struct DemoSession {
    pub id: Uuid,
    pub requester_id: String,
    pub sandbox: SandboxHandle,
    pub claimed_at: Instant,
    pub expires_at: Instant,
    pub usage_count: u32,
    pub usage_cap: u32,
    pub status: SessionStatus,
    /// Usage reserved by `apply_usage` calls whose spend is still being recorded.
    pub(crate) pending_usage: u32,
}

impl DemoSession {
    pub fn new(
        requester_id: &str,
        sandbox: SandboxHandle,
        now: Instant,
        duration: Duration,
        usage_cap: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id: requester_id.to_string(),
            sandbox,
            claimed_at: now,
            expires_at: now + duration,
            usage_count: 0,
            usage_cap,
            status: SessionStatus::Active,
            pending_usage: 0,
        }
    }

    pub fn usage_remaining(&self) -> u32 {
        self.usage_cap.saturating_sub(self.usage_count)
    }

    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn is_past_deadline(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Moves an active session to `to`. Returns false if it was already terminal,
    /// so only the first caller acts on the transition.
    pub fn finish(&mut self, to: SessionStatus) -> bool {
        if self.status.is_terminal() || !to.is_terminal() {
            return false;
        }
        self.status = to;
        true
    }
}

/// Both registries plus the queue of sandboxes awaiting destruction.
#[derive(Debug)]
pub struct Registry {
    warm: HashMap<String, WarmSandbox>,
    sessions: HashMap<Uuid, DemoSession>,
    retired: VecDeque<SandboxHandle>,
    empty_since: Option<Instant>,
}

impl Registry {
    pub fn new(now: Instant) -> Self {
        Self {
            warm: HashMap::new(),
            sessions: HashMap::new(),
            retired: VecDeque::new(),
            empty_since: Some(now),
        }
    }

    pub fn warm_count(&self) -> usize {
        self.warm.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    pub fn warm_ids(&self) -> Vec<String> {
        self.warm.keys().cloned().collect()
    }

    /// How long the warm table has continuously held no claimable slot.
    pub fn empty_for(&self, now: Instant) -> Option<Duration> {
        self.empty_since.map(|since| now.saturating_duration_since(since))
    }

    /// Starts or stops the empty clock depending on whether any healthy slot is left.
    fn refresh_empty(&mut self, now: Instant) {
        if self.warm.values().any(|slot| slot.healthy) {
            self.empty_since = None;
        } else if self.empty_since.is_none() {
            self.empty_since = Some(now);
        }
    }

    pub fn insert_warm(&mut self, slot: WarmSandbox) {
        let now = slot.created_at;
        self.warm.insert(slot.handle.id.clone(), slot);
        self.refresh_empty(now);
    }

    fn remove_warm(&mut self, id: &str, now: Instant) -> Option<WarmSandbox> {
        let slot = self.warm.remove(id);
        self.refresh_empty(now);
        slot
    }

    /// Removes any healthy warm slot.
    pub fn take_healthy(&mut self, now: Instant) -> Option<WarmSandbox> {
        let id = self
            .warm
            .values()
            .find(|slot| slot.healthy)
            .map(|slot| slot.handle.id.clone())?;
        self.remove_warm(&id, now)
    }

    /// Removes up to `limit` warm slots created more than `max_age` ago, oldest first.
    pub fn take_idle(&mut self, now: Instant, max_age: Duration, limit: usize) -> Vec<SandboxHandle> {
        let mut idle: Vec<(Instant, String)> = self
            .warm
            .values()
            .filter(|slot| now.saturating_duration_since(slot.created_at) > max_age)
            .map(|slot| (slot.created_at, slot.handle.id.clone()))
            .collect();
        idle.sort();
        idle.into_iter()
            .take(limit)
            .filter_map(|(_, id)| self.remove_warm(&id, now))
            .map(|slot| slot.handle)
            .collect()
    }

    /// Records a probe result. An unhealthy slot that is still warm is removed
    /// and returned for destruction; a slot claimed in the meantime is left alone.
    pub fn record_health(&mut self, id: &str, healthy: bool, now: Instant) -> Option<SandboxHandle> {
        let slot = self.warm.get_mut(id)?;
        slot.last_health_check = now;
        slot.healthy = healthy;
        if healthy {
            self.refresh_empty(now);
            return None;
        }
        self.remove_warm(id, now).map(|slot| slot.handle)
    }

    pub fn insert_session(&mut self, session: DemoSession) {
        self.sessions.insert(session.id, session);
    }

    pub fn session(&self, id: &Uuid) -> Option<&DemoSession> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &Uuid) -> Option<&mut DemoSession> {
        self.sessions.get_mut(id)
    }

    pub fn remove_session(&mut self, id: &Uuid) -> Option<DemoSession> {
        self.sessions.remove(id)
    }

    /// Marks every active session past its deadline as expired. Returns how many
    /// transitioned.
    pub fn expire_overdue(&mut self, now: Instant) -> usize {
        self.sessions
            .values_mut()
            .filter(|s| s.status == SessionStatus::Active && s.is_past_deadline(now))
            .map(|s| s.finish(SessionStatus::Expired))
            .filter(|transitioned| *transitioned)
            .count()
    }

    /// Removes every terminal session and returns their sandboxes.
    pub fn remove_terminal(&mut self) -> Vec<SandboxHandle> {
        let terminal: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        terminal
            .iter()
            .filter_map(|id| self.sessions.remove(id))
            .map(|s| s.sandbox)
            .collect()
    }

    pub fn retire(&mut self, handle: SandboxHandle) {
        self.retired.push_back(handle);
    }

    pub fn drain_retired(&mut self) -> Vec<SandboxHandle> {
        self.retired.drain(..).collect()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Empties every table, returning all sandboxes still held.
    pub fn drain_all(&mut self, now: Instant) -> Vec<SandboxHandle> {
        let mut handles: Vec<SandboxHandle> = self.warm.drain().map(|(_, s)| s.handle).collect();
        handles.extend(self.sessions.drain().map(|(_, s)| s.sandbox));
        handles.extend(self.retired.drain(..));
        self.empty_since = Some(now);
        handles
    }

    /// True when no sandbox id is both warm and bound to a session.
    pub fn is_disjoint(&self) -> bool {
        self.sessions
            .values()
            .all(|s| !self.warm.contains_key(&s.sandbox.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> SandboxHandle {
        SandboxHandle {
            id: id.to_string(),
            endpoint: format!("mock://{id}"),
            flavor: "node".to_string(),
        }
    }

    #[test]
    fn session_transitions_only_forward() {
        let now = Instant::now();
        let mut session = DemoSession::new("ip-1", handle("a"), now, Duration::from_secs(5), 3);
        assert!(!session.finish(SessionStatus::Active));
        assert!(session.finish(SessionStatus::Released));
        assert!(!session.finish(SessionStatus::Expired));
        assert_eq!(session.status, SessionStatus::Released);
    }

    #[test]
    fn take_healthy_skips_unhealthy_slots() {
        let now = Instant::now();
        let mut registry = Registry::new(now);
        let mut sick = WarmSandbox::new(handle("sick"), now);
        sick.healthy = false;
        registry.insert_warm(sick);
        assert!(registry.take_healthy(now).is_none());

        registry.insert_warm(WarmSandbox::new(handle("ok"), now));
        let slot = registry.take_healthy(now).unwrap();
        assert_eq!(slot.handle.id, "ok");
        assert_eq!(registry.warm_count(), 1);
    }

    #[test]
    fn tracks_how_long_warm_table_is_empty() {
        let start = Instant::now();
        let mut registry = Registry::new(start);
        assert_eq!(registry.empty_for(start), Some(Duration::ZERO));

        registry.insert_warm(WarmSandbox::new(handle("a"), start));
        assert_eq!(registry.empty_for(start), None);

        let later = start + Duration::from_secs(3);
        registry.take_healthy(later).unwrap();
        let much_later = later + Duration::from_secs(7);
        assert_eq!(registry.empty_for(much_later), Some(Duration::from_secs(7)));
    }

    #[test]
    fn unhealthy_slots_leave_the_empty_clock_running() {
        let start = Instant::now();
        let mut registry = Registry::new(start);
        let mut sick = WarmSandbox::new(handle("sick"), start);
        sick.healthy = false;
        registry.insert_warm(sick);

        let later = start + Duration::from_secs(4);
        assert_eq!(registry.empty_for(later), Some(Duration::from_secs(4)));

        assert!(registry.record_health("sick", true, later).is_none());
        assert_eq!(registry.empty_for(later), None);
    }

    #[test]
    fn take_idle_returns_oldest_first_up_to_limit() {
        let start = Instant::now();
        let mut registry = Registry::new(start);
        registry.insert_warm(WarmSandbox::new(handle("old"), start));
        registry.insert_warm(WarmSandbox::new(handle("older"), start - Duration::from_secs(5)));
        registry.insert_warm(WarmSandbox::new(handle("fresh"), start + Duration::from_secs(50)));

        let now = start + Duration::from_secs(60);
        let retired = registry.take_idle(now, Duration::from_secs(30), 1);
        assert_eq!(retired, vec![handle("older")]);

        let retired = registry.take_idle(now, Duration::from_secs(30), 5);
        assert_eq!(retired, vec![handle("old")]);
        assert_eq!(registry.warm_ids(), vec!["fresh".to_string()]);
    }

    #[test]
    fn unhealthy_probe_evicts_only_warm_slots() {
        let now = Instant::now();
        let mut registry = Registry::new(now);
        registry.insert_warm(WarmSandbox::new(handle("a"), now));
        assert!(registry.record_health("a", true, now).is_none());
        assert_eq!(registry.record_health("a", false, now), Some(handle("a")));
        assert!(registry.record_health("a", false, now).is_none());
    }

    #[test]
    fn expire_and_remove_terminal_sessions() {
        let now = Instant::now();
        let mut registry = Registry::new(now);
        let short = DemoSession::new("ip-1", handle("a"), now, Duration::from_secs(1), 3);
        let long = DemoSession::new("ip-2", handle("b"), now, Duration::from_secs(60), 3);
        let long_id = long.id;
        registry.insert_session(short);
        registry.insert_session(long);

        let later = now + Duration::from_secs(2);
        assert_eq!(registry.expire_overdue(later), 1);
        assert_eq!(registry.expire_overdue(later), 0);
        assert_eq!(registry.active_count(), 1);

        assert_eq!(registry.remove_terminal(), vec![handle("a")]);
        assert!(registry.session(&long_id).is_some());
        assert!(registry.remove_terminal().is_empty());
    }
}
