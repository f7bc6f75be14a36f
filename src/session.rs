// =============================================================================
// Session Orchestrator — single-owner trading lease with TTL
// =============================================================================
//
// Exactly one owner may hold the trading session at a time. Leases expire
// passively: expiry is applied on read (`status`) and re-checked inside
// `acquire`, so no background sweeper is needed.
// =============================================================================

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::types::{epoch_now, SessionPhase, SessionState};

/// Lease granted to the in-process gateway at bootstrap so read paths work
/// before an operator reconnects.
pub const BOOTSTRAP_OWNER: &str = "gateway";
const BOOTSTRAP_TTL_SEC: i64 = 12 * 3600;

pub struct SessionOrchestrator {
    state: Mutex<SessionState>,
}

impl SessionOrchestrator {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                mode: mode.into(),
                owner: None,
                state: SessionPhase::Idle,
                source: "init".to_string(),
                lease_expires_at: None,
            }),
        }
    }

    /// Construct and immediately grant the long bootstrap lease.
    pub fn bootstrap(mode: impl Into<String>) -> Self {
        let orchestrator = Self::new(mode);
        orchestrator.acquire(BOOTSTRAP_OWNER, BOOTSTRAP_TTL_SEC, "bootstrap");
        orchestrator
    }

    /// Attempt to take the lease. Fails only when a *different* owner holds an
    /// unexpired lease; the current owner may re-acquire to extend.
    pub fn acquire(&self, owner: &str, ttl_sec: i64, source: &str) -> bool {
        let now = epoch_now();
        let mut state = self.state.lock();
        Self::demote_if_expired(&mut state, now);

        if let Some(current) = &state.owner {
            if current != owner {
                warn!(
                    owner,
                    current = %current,
                    source,
                    "lease acquisition refused — held by another owner"
                );
                return false;
            }
        }

        state.owner = Some(owner.to_string());
        state.state = SessionPhase::Active;
        state.source = source.to_string();
        state.lease_expires_at = Some(now + ttl_sec);
        info!(owner, ttl_sec, source, "session lease acquired");
        true
    }

    /// Release the lease. Only the current owner may release.
    pub fn release(&self, owner: &str, source: &str) -> bool {
        let now = epoch_now();
        let mut state = self.state.lock();
        Self::demote_if_expired(&mut state, now);

        match &state.owner {
            Some(current) if current == owner => {
                state.owner = None;
                state.state = SessionPhase::Idle;
                state.source = source.to_string();
                state.lease_expires_at = None;
                info!(owner, source, "session lease released");
                true
            }
            _ => {
                warn!(owner, source, "lease release refused — not the owner");
                false
            }
        }
    }

    /// Deep copy of the current state, with expiry demotion applied first.
    pub fn status(&self) -> SessionState {
        let now = epoch_now();
        let mut state = self.state.lock();
        Self::demote_if_expired(&mut state, now);
        state.clone()
    }

    fn demote_if_expired(state: &mut SessionState, now: i64) {
        if let Some(expires_at) = state.lease_expires_at {
            if now >= expires_at {
                info!(owner = ?state.owner, "session lease expired — demoting to IDLE");
                state.owner = None;
                state.state = SessionPhase::Idle;
                state.source = "lease-expired".to_string();
                state.lease_expires_at = None;
            }
        }
    }
}
