use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Waiting,
    Satisfied,
    TimedOut,
}

// Bounded wait primitive gating startup progress on an external readiness
// signal: the window manager advertising itself, or a system tray appearing.
// Transitions are monotonic (never back to Idle once armed) and each gate is
// single-use; a fresh instance is created per startup phase, and only one is
// outstanding at a time. The timeout is a safety net against a misbehaving or
// absent window manager: startup deliberately proceeds when it fires.
pub struct SyncGate {
    what: &'static str,
    state: GateState,
    timeout: Duration,
}

impl SyncGate {
    pub fn new(what: &'static str, timeout: Duration) -> Self {
        Self {
            what,
            state: GateState::Idle,
            timeout,
        }
    }

    pub fn arm(&mut self) {
        if self.state == GateState::Idle {
            self.state = GateState::Waiting;
        } else {
            warn!(gate = self.what, state = ?self.state, "gate armed twice");
        }
    }

    // First wake wins; anything after a terminal state is ignored.
    pub fn satisfy(&mut self) {
        if self.state == GateState::Waiting {
            debug!(gate = self.what, "gate satisfied");
            self.state = GateState::Satisfied;
        }
    }

    pub fn expire(&mut self) {
        if self.state == GateState::Waiting {
            warn!(gate = self.what, timeout = ?self.timeout, "gate timed out");
            self.state = GateState::TimedOut;
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.state == GateState::Waiting
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
