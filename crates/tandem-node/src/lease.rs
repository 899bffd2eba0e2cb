//! Lease state machine.
//!
//! A [`Lease`] layers time-bounded ownership on top of a
//! [`LockBackend`](crate::backend::LockBackend):
//!
//! ```text
//! Idle ──► Acquiring ──► Held ◄──► Renewing
//!   ▲          │           │          │
//!   │          ▼           ├──────────┴──► Lost
//!   └───────── Idle        └─────────────► Released
//! ```
//!
//! `Lost` and `Released` end an acquisition cycle; a new cycle starts from
//! `Idle`. The backend's `expires_at` is recorded as reported, never computed
//! locally. Locally the lease is only trusted until `safe_until`, measured
//! from when the last successful request was *sent*, so slow round trips
//! shorten the window rather than extend it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tandem_core::error::{Error, Result};
use tandem_core::id::{FencingToken, HolderId};
use tokio::time::Instant;

use crate::backend::LeaseGrant;

/// State of a lease within an acquisition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Not holding and not trying to.
    Idle,
    /// An acquisition attempt is in flight.
    Acquiring,
    /// The lock is held.
    Held,
    /// The lock is held and a renewal is in flight.
    Renewing,
    /// Ownership was lost while held.
    Lost,
    /// Ownership was given up voluntarily.
    Released,
}

impl LeaseState {
    /// Returns true if this state ends an acquisition cycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Lost | Self::Released)
    }

    /// Returns true if the lock is believed to be held.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        matches!(self, Self::Held | Self::Renewing)
    }

    /// Returns true if moving to `target` is a valid transition.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Idle => matches!(target, Self::Acquiring),
            Self::Acquiring => matches!(target, Self::Held | Self::Idle),
            Self::Held => matches!(target, Self::Renewing | Self::Lost | Self::Released),
            Self::Renewing => matches!(target, Self::Held | Self::Lost | Self::Released),
            Self::Lost | Self::Released => matches!(target, Self::Idle),
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Renewing => "renewing",
            Self::Lost => "lost",
            Self::Released => "released",
        }
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Point-in-time view of a lease, safe to hand out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseSnapshot {
    /// The lock this lease is on.
    pub lock_id: String,
    /// The holder identity this lease acquires under.
    pub holder_id: HolderId,
    /// Current state.
    pub state: LeaseState,
    /// When the lock was acquired, by the backend clock.
    pub acquired_at: Option<DateTime<Utc>>,
    /// When the lease expires, by the backend clock.
    pub expires_at: Option<DateTime<Utc>>,
    /// Fencing token of the current acquisition.
    pub fencing_token: Option<FencingToken>,
}

/// Time-bounded ownership of one lock by one holder.
#[derive(Debug, Clone)]
pub struct Lease {
    lock_id: String,
    holder_id: HolderId,
    state: LeaseState,
    acquired_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    fencing_token: Option<FencingToken>,
    safe_until: Option<Instant>,
    safe_window: Duration,
}

impl Lease {
    /// Creates an idle lease.
    ///
    /// `safe_window` is the lease duration minus the deadline margin.
    #[must_use]
    pub fn new(lock_id: impl Into<String>, holder_id: HolderId, safe_window: Duration) -> Self {
        Self {
            lock_id: lock_id.into(),
            holder_id,
            state: LeaseState::Idle,
            acquired_at: None,
            expires_at: None,
            fencing_token: None,
            safe_until: None,
            safe_window,
        }
    }

    /// Returns the lock identifier.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Returns the holder identity.
    #[must_use]
    pub fn holder_id(&self) -> &HolderId {
        &self.holder_id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> LeaseState {
        self.state
    }

    /// Returns true if the lock is believed to be held.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.state.is_held()
    }

    /// Returns the backend-reported expiry of the current acquisition.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Returns the fencing token of the current acquisition.
    #[must_use]
    pub const fn fencing_token(&self) -> Option<FencingToken> {
        self.fencing_token
    }

    /// Returns the local instant after which the lease must not be relied on.
    #[must_use]
    pub const fn safe_until(&self) -> Option<Instant> {
        self.safe_until
    }

    /// Returns true if `now` is past the local safety deadline.
    #[must_use]
    pub fn safe_deadline_passed(&self, now: Instant) -> bool {
        self.safe_until.is_some_and(|deadline| now >= deadline)
    }

    /// Returns a snapshot of the lease.
    #[must_use]
    pub fn snapshot(&self) -> LeaseSnapshot {
        LeaseSnapshot {
            lock_id: self.lock_id.clone(),
            holder_id: self.holder_id.clone(),
            state: self.state,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            fencing_token: self.fencing_token,
        }
    }

    fn transition(&mut self, target: LeaseState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_label().to_string(),
                to: target.as_label().to_string(),
            });
        }
        tracing::trace!(
            lock_id = %self.lock_id,
            from = self.state.as_label(),
            to = target.as_label(),
            "lease transition"
        );
        self.state = target;
        Ok(())
    }

    fn clear(&mut self) {
        self.acquired_at = None;
        self.expires_at = None;
        self.fencing_token = None;
        self.safe_until = None;
    }

    /// Starts an acquisition attempt, beginning a new cycle if the last one ended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if an attempt is already in
    /// flight or the lock is held.
    pub fn begin_acquire(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            self.reset();
        }
        self.transition(LeaseState::Acquiring)
    }

    /// Records a grant. `requested_at` is when the acquire request was sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless acquiring.
    pub fn granted(&mut self, grant: &LeaseGrant, requested_at: Instant) -> Result<()> {
        self.transition(LeaseState::Held)?;
        self.acquired_at = Some(grant.acquired_at);
        self.expires_at = Some(grant.expires_at);
        self.fencing_token = Some(grant.fencing_token);
        self.safe_until = Some(requested_at + self.safe_window);
        Ok(())
    }

    /// Records that the backend declined the acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless acquiring.
    pub fn declined(&mut self) -> Result<()> {
        self.transition(LeaseState::Idle)?;
        self.clear();
        Ok(())
    }

    /// Marks a renewal as in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless held.
    pub fn begin_renew(&mut self) -> Result<()> {
        self.transition(LeaseState::Renewing)
    }

    /// Records a successful renewal. Neither expiry moves backwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless renewing.
    pub fn renewed(&mut self, expires_at: DateTime<Utc>, requested_at: Instant) -> Result<()> {
        self.require(LeaseState::Renewing, LeaseState::Held)?;
        self.transition(LeaseState::Held)?;
        self.expires_at = Some(self.expires_at.map_or(expires_at, |prev| prev.max(expires_at)));
        let candidate = requested_at + self.safe_window;
        self.safe_until = Some(self.safe_until.map_or(candidate, |prev| prev.max(candidate)));
        Ok(())
    }

    /// Returns to `Held` after a renewal that could not reach the backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless renewing.
    pub fn renew_deferred(&mut self) -> Result<()> {
        self.require(LeaseState::Renewing, LeaseState::Held)?;
        self.transition(LeaseState::Held)
    }

    /// Records that ownership was lost.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless held.
    pub fn lost(&mut self) -> Result<()> {
        self.transition(LeaseState::Lost)?;
        self.safe_until = None;
        Ok(())
    }

    /// Records a voluntary release.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless held.
    pub fn released(&mut self) -> Result<()> {
        self.transition(LeaseState::Released)?;
        self.safe_until = None;
        Ok(())
    }

    /// Abandons the current cycle and returns to `Idle`.
    pub fn reset(&mut self) {
        if self.state != LeaseState::Idle {
            tracing::trace!(lock_id = %self.lock_id, from = self.state.as_label(), "lease reset");
        }
        self.state = LeaseState::Idle;
        self.clear();
    }

    fn require(&self, expected: LeaseState, target: LeaseState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: self.state.as_label().to_string(),
                to: target.as_label().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1500);

    fn grant(expires_in_ms: i64, token: u64) -> LeaseGrant {
        let now = Utc::now();
        LeaseGrant {
            holder_id: HolderId::generate(),
            acquired_at: now,
            expires_at: now + chrono::TimeDelta::milliseconds(expires_in_ms),
            fencing_token: FencingToken::from_sequence(token),
        }
    }

    fn held_lease() -> Lease {
        let mut lease = Lease::new("live", HolderId::generate(), WINDOW);
        lease.begin_acquire().expect("acquire");
        lease.granted(&grant(2000, 1), Instant::now()).expect("grant");
        lease
    }

    #[test]
    fn valid_transitions() {
        use LeaseState::*;
        assert!(Idle.can_transition_to(Acquiring));
        assert!(Acquiring.can_transition_to(Held));
        assert!(Acquiring.can_transition_to(Idle));
        assert!(Held.can_transition_to(Renewing));
        assert!(Renewing.can_transition_to(Held));
        assert!(Renewing.can_transition_to(Lost));
        assert!(Held.can_transition_to(Released));
        assert!(Lost.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Held));
        assert!(!Idle.can_transition_to(Renewing));
        assert!(!Acquiring.can_transition_to(Lost));
        assert!(!Lost.can_transition_to(Held));
        assert!(!Released.can_transition_to(Renewing));
    }

    #[test]
    fn terminal_states() {
        assert!(LeaseState::Lost.is_terminal());
        assert!(LeaseState::Released.is_terminal());
        assert!(!LeaseState::Held.is_terminal());
        assert!(LeaseState::Renewing.is_held());
        assert!(!LeaseState::Acquiring.is_held());
    }

    #[test]
    fn grant_records_backend_expiry_and_token() {
        let mut lease = Lease::new("live", HolderId::generate(), WINDOW);
        let g = grant(2000, 7);
        let sent = Instant::now();
        lease.begin_acquire().expect("acquire");
        lease.granted(&g, sent).expect("grant");

        assert_eq!(lease.state(), LeaseState::Held);
        assert_eq!(lease.expires_at(), Some(g.expires_at));
        assert_eq!(lease.fencing_token(), Some(FencingToken::from_sequence(7)));
        assert_eq!(lease.safe_until(), Some(sent + WINDOW));
    }

    #[test]
    fn declined_returns_to_idle() {
        let mut lease = Lease::new("live", HolderId::generate(), WINDOW);
        lease.begin_acquire().expect("acquire");
        lease.declined().expect("decline");
        assert_eq!(lease.state(), LeaseState::Idle);
        assert!(lease.begin_acquire().is_ok());
    }

    #[test]
    fn cannot_acquire_twice() {
        let mut lease = held_lease();
        let err = lease.begin_acquire().expect_err("already held");
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn renewal_never_moves_expiry_backwards() {
        let mut lease = held_lease();
        let before = lease.expires_at().expect("expiry");
        let safe_before = lease.safe_until().expect("safe");

        lease.begin_renew().expect("renew");
        lease
            .renewed(before - chrono::TimeDelta::seconds(1), Instant::now())
            .expect("renewed");
        assert_eq!(lease.expires_at(), Some(before));
        assert!(lease.safe_until().expect("safe") >= safe_before);

        let later = before + chrono::TimeDelta::seconds(1);
        lease.begin_renew().expect("renew");
        lease.renewed(later, Instant::now()).expect("renewed");
        assert_eq!(lease.expires_at(), Some(later));
    }

    #[test]
    fn renew_requires_held() {
        let mut lease = Lease::new("live", HolderId::generate(), WINDOW);
        assert!(lease.begin_renew().is_err());
        assert!(lease.renewed(Utc::now(), Instant::now()).is_err());

        let mut lease = held_lease();
        lease.begin_renew().expect("renew");
        assert!(lease.begin_renew().is_err(), "renewals are serialized");
        lease.renew_deferred().expect("deferred");
        assert_eq!(lease.state(), LeaseState::Held);
    }

    #[test]
    fn lost_and_released_end_the_cycle() {
        let mut lease = held_lease();
        lease.begin_renew().expect("renew");
        lease.lost().expect("lost");
        assert_eq!(lease.state(), LeaseState::Lost);
        assert!(lease.released().is_err());
        assert!(!lease.safe_deadline_passed(Instant::now()));

        lease.begin_acquire().expect("new cycle");
        assert_eq!(lease.state(), LeaseState::Acquiring);
        assert_eq!(lease.fencing_token(), None);

        let mut lease = held_lease();
        lease.released().expect("released");
        assert!(lease.lost().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn safe_deadline_tracks_request_time() {
        let lease = held_lease();
        assert!(!lease.safe_deadline_passed(Instant::now()));
        tokio::time::advance(WINDOW).await;
        assert!(lease.safe_deadline_passed(Instant::now()));
    }

    #[test]
    fn snapshot_serializes_state_label() {
        let lease = held_lease();
        let json = serde_json::to_value(lease.snapshot()).expect("serialize");
        assert_eq!(json["state"], "held");
        assert_eq!(json["fencing_token"], 1);
    }
}
