//! Service state gate consulted by the liveness, readiness and health endpoints.

use std::sync::atomic::{AtomicU8, Ordering};

/// Answers the liveness and readiness questions and lets the lifecycle manager drive warm-up
/// and shutdown.
///
/// `warm_up` is called once when the service starts running; `shut_down`
/// once, after the listeners have been closed and before the exit function
/// runs. Implementations that need asynchronous warm-up work should spawn it
/// from `warm_up` and report not-ready until it completes.
pub trait ServiceState: Send + Sync + 'static {
    fn is_live(&self) -> bool;
    fn is_ready(&self) -> bool;
    fn is_healthy(&self) -> bool;
    fn warm_up(&self);
    fn shut_down(&self);
}

/// Always live, ready and healthy; warm-up and shutdown do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultServiceState;

impl ServiceState for DefaultServiceState {
    fn is_live(&self) -> bool { true }
    fn is_ready(&self) -> bool { true }
    fn is_healthy(&self) -> bool { true }
    fn warm_up(&self) {}
    fn shut_down(&self) {}
}

/// Phase of a [`TrackedServiceState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    WarmingUp = 0,
    Ready = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::WarmingUp,
            1 => Self::Ready,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// A gate that follows `WarmingUp -> Ready -> ShuttingDown -> Stopped`.
///
/// Live while warming up or ready, ready and healthy only once warmed up.
/// `warm_up` marks the gate ready unless shutdown already began; callers with
/// real warm-up work can instead call [`TrackedServiceState::set_phase`].
#[derive(Debug)]
pub struct TrackedServiceState {
    phase: AtomicU8,
}

impl TrackedServiceState {
    pub fn new() -> Self {
        Self { phase: AtomicU8::new(Phase::WarmingUp as u8) }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

impl Default for TrackedServiceState {
    fn default() -> Self { Self::new() }
}

impl ServiceState for TrackedServiceState {
    fn is_live(&self) -> bool {
        matches!(self.phase(), Phase::WarmingUp | Phase::Ready)
    }

    fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    fn is_healthy(&self) -> bool {
        self.phase() == Phase::Ready
    }

    fn warm_up(&self) {
        // Only WarmingUp may move to Ready; a late warm-up must not revive a
        // gate that is already shutting down.
        let _ = self.phase.compare_exchange(
            Phase::WarmingUp as u8,
            Phase::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn shut_down(&self) {
        self.set_phase(Phase::ShuttingDown);
        tracing::debug!("service state shutting down");
        self.set_phase(Phase::Stopped);
    }
}
