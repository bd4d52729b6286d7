//! Admission gate for remote sends
//!
//! ## Circuit Breaker States
//!
//! ```text
//! CLOSED ──failure_threshold──> OPEN ──recovery_timeout──> HALF_OPEN
//!   ^                                                        │
//!   └──────── success_threshold ──────────┬── failure ───────┘
//!                                         └──> OPEN
//! ```
//!
//! All state lives in atomics so `is_passable` can sit on the send path.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fail-fast check consulted before a remote send
pub trait AdmissionGate: Send + Sync {
    fn is_passable(&self) -> bool;
    fn record_failure(&self);
    fn record_success(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation, every send passes
    Closed = 0,
    /// Failing, sends are refused without touching the network
    Open = 1,
    /// Probing recovery with a limited number of sends
    HalfOpen = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before probing
    pub recovery_timeout: Duration,
    /// Successes in half-open needed to close again
    pub success_threshold: u32,
    /// Sends admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_calls: 5,
        }
    }
}

impl CircuitBreakerConfig {
    /// Short recovery window for low-latency paths
    pub fn fast_recovery() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(5),
            success_threshold: 2,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct CircuitBreakerGate {
    config: CircuitBreakerConfig,
    epoch: Instant,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    half_open_calls: AtomicU32,
    opened_at_ms: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreakerGate {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed.into()),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            match to {
                CircuitState::Open => {
                    self.opened_at_ms.store(self.now_ms(), Ordering::Release);
                    warn!(?from, "admission gate opened");
                }
                CircuitState::HalfOpen => {
                    self.half_open_calls.store(0, Ordering::Release);
                    self.half_open_successes.store(0, Ordering::Release);
                    info!("admission gate probing recovery");
                }
                CircuitState::Closed => {
                    self.consecutive_failures.store(0, Ordering::Release);
                    info!("admission gate closed");
                }
            }
        }
        swapped
    }
}

impl Default for CircuitBreakerGate {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl AdmissionGate for CircuitBreakerGate {
    fn is_passable(&self) -> bool {
        let passable = match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                let recovery = self.config.recovery_timeout.as_millis() as u64;
                if self.now_ms().saturating_sub(opened) >= recovery {
                    self.transition(CircuitState::Open, CircuitState::HalfOpen);
                    self.half_open_calls.fetch_add(1, Ordering::AcqRel)
                        < self.config.half_open_max_calls
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_calls.fetch_add(1, Ordering::AcqRel)
                    < self.config.half_open_max_calls
            }
        };
        if !passable {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        passable
    }

    fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::Closed => self.consecutive_failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(recovery_ms: u64) -> CircuitBreakerGate {
        CircuitBreakerGate::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(recovery_ms),
            success_threshold: 2,
            half_open_max_calls: 2,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let gate = gate(60_000);
        gate.record_failure();
        gate.record_failure();
        gate.record_success();
        gate.record_failure();
        gate.record_failure();
        assert_eq!(gate.state(), CircuitState::Closed);

        gate.record_failure();
        assert_eq!(gate.state(), CircuitState::Open);
        assert!(!gate.is_passable());
        assert_eq!(gate.stats().rejected, 1);
    }

    #[test]
    fn test_half_open_limits_probes_then_closes() {
        let gate = gate(0);
        for _ in 0..3 {
            gate.record_failure();
        }
        assert_eq!(gate.state(), CircuitState::Open);

        assert!(gate.is_passable());
        assert_eq!(gate.state(), CircuitState::HalfOpen);
        assert!(gate.is_passable());
        assert!(!gate.is_passable());

        gate.record_success();
        gate.record_success();
        assert_eq!(gate.state(), CircuitState::Closed);
        assert!(gate.is_passable());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let gate = gate(0);
        for _ in 0..3 {
            gate.record_failure();
        }
        assert!(gate.is_passable());
        gate.record_failure();
        assert_eq!(gate.state(), CircuitState::Open);
    }
}
