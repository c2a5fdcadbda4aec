/// Per-role circuit breaker
///
/// Closed until either `failure_threshold` consecutive failures or an error
/// rate above `error_rate_threshold` over a full window of `window_size`
/// calls. Open rejects every call without touching a pool. Once the open
/// duration has elapsed the next caller becomes the single half-open probe;
/// its outcome closes the circuit or reopens it with a longer duration.
use crate::config::BreakerConfig;
use crate::core::{Clock, PoolRole};
use crate::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_HALF_OPEN: u8 = 1;
const STATE_OPEN: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            STATE_HALF_OPEN => Self::HalfOpen,
            STATE_OPEN => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl From<CircuitState> for u8 {
    fn from(value: CircuitState) -> Self {
        match value {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
            CircuitState::Open => STATE_OPEN,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::HalfOpen => write!(f, "half_open"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

struct BreakerInner {
    consecutive_failures: u32,
    /// Most recent outcomes, `true` for failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    open_for: Duration,
    trips: u32,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub error_rate: f64,
    pub trips: u32,
    pub retry_after_ms: Option<u64>,
}

pub struct CircuitBreaker {
    role: PoolRole,
    settings: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(role: PoolRole, settings: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            role,
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                window: VecDeque::with_capacity(settings.window_size),
                opened_at: None,
                open_for: settings.open_duration(),
                trips: 0,
                probe_in_flight: false,
            }),
            settings,
            clock,
            state: AtomicU8::new(STATE_CLOSED),
        }
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Ask to make one call. Fails with `CircuitOpen` while open, or while
    /// half-open with the probe already taken.
    pub fn try_acquire(&self) -> CacheResult<CallPermit<'_>> {
        if self.state() == CircuitState::Closed {
            return Ok(CallPermit::new(self, false));
        }

        let mut guard = self.inner.lock();
        match self.state() {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    Err(CacheError::CircuitOpen { role: self.role })
                } else {
                    guard.probe_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
            CircuitState::Open => {
                let elapsed = guard
                    .opened_at
                    .map(|at| self.clock.now().saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed < guard.open_for {
                    return Err(CacheError::CircuitOpen { role: self.role });
                }
                info!(role = %self.role, "circuit half-open, sending probe");
                self.state.store(STATE_HALF_OPEN, Ordering::Release);
                guard.probe_in_flight = true;
                Ok(CallPermit::new(self, true))
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut guard = self.inner.lock();
        guard.consecutive_failures = 0;

        if probe {
            info!(role = %self.role, trips = guard.trips, "circuit closed after successful probe");
            guard.probe_in_flight = false;
            guard.window.clear();
            guard.trips = 0;
            guard.opened_at = None;
            guard.open_for = self.settings.open_duration();
            self.state.store(STATE_CLOSED, Ordering::Release);
            return;
        }

        if self.state() == CircuitState::Closed {
            self.push_outcome(&mut guard, false);
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut guard = self.inner.lock();

        if probe {
            guard.probe_in_flight = false;
            self.trip(&mut guard);
            return;
        }
        if self.state() != CircuitState::Closed {
            // A call admitted before the trip; the circuit is already open
            return;
        }

        guard.consecutive_failures += 1;
        self.push_outcome(&mut guard, true);

        let window_full = guard.window.len() >= self.settings.window_size;
        if guard.consecutive_failures >= self.settings.failure_threshold
            || (window_full && guard.error_rate() > self.settings.error_rate_threshold)
        {
            self.trip(&mut guard);
        }
    }

    fn push_outcome(&self, guard: &mut BreakerInner, failed: bool) {
        if guard.window.len() >= self.settings.window_size {
            guard.window.pop_front();
        }
        guard.window.push_back(failed);
    }

    fn trip(&self, guard: &mut BreakerInner) {
        guard.trips += 1;
        let factor = self
            .settings
            .backoff_multiplier
            .powi(guard.trips.saturating_sub(1) as i32);
        let open_for = self.settings.open_duration().mul_f64(factor);
        guard.open_for = open_for.min(self.settings.max_open_duration());
        guard.opened_at = Some(self.clock.now());
        self.state.store(STATE_OPEN, Ordering::Release);

        warn!(
            role = %self.role,
            trips = guard.trips,
            consecutive_failures = guard.consecutive_failures,
            error_rate = guard.error_rate(),
            open_ms = guard.open_for.as_millis() as u64,
            "circuit opened"
        );
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let guard = self.inner.lock();
        let state = self.state();
        let retry_after_ms = match (state, guard.opened_at) {
            (CircuitState::Open, Some(at)) => {
                let elapsed = self.clock.now().saturating_duration_since(at);
                Some(guard.open_for.saturating_sub(elapsed).as_millis() as u64)
            }
            _ => None,
        };
        BreakerSnapshot {
            state,
            consecutive_failures: guard.consecutive_failures,
            error_rate: guard.error_rate(),
            trips: guard.trips,
            retry_after_ms,
        }
    }
}

/// Admission for a single call. Record the outcome with `success` or
/// `failure`; dropping it unrecorded leaves the circuit untouched and frees
/// the half-open probe slot.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    recorded: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            recorded: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a completed call; calls slower than the configured slow-call
    /// threshold count as failures
    pub fn success(mut self, elapsed: Duration) {
        self.recorded = true;
        match self.breaker.settings.slow_call_threshold() {
            Some(limit) if elapsed > limit => self.breaker.on_failure(self.probe),
            _ => self.breaker.on_success(self.probe),
        }
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.on_failure(self.probe);
    }

    /// Record the outcome of `result`, counting only errors that say
    /// something about the backend
    pub fn record<T>(self, result: &CacheResult<T>, elapsed: Duration) {
        match result {
            Ok(_) => self.success(elapsed),
            Err(e) if e.counts_as_backend_failure() => self.failure(),
            Err(_) => drop(self),
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.recorded {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}
