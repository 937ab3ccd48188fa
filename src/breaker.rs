//! Per-provider circuit breaker registry.
//!
//! One state machine per provider id: `closed → open → half-open → closed`.
//! The registry is process-local and rebuilt on restart; every worker in
//! the process shares one instance so a misbehaving provider is cut off
//! everywhere at once. Tests inject a fresh registry instead of reaching
//! for globals.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::BreakerConfig;

/// Observable state of one provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

/// Outcome of a provider call, reported back after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct Cell {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while the single half-open probe is in flight.
    probe_issued: bool,
}

impl Cell {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_issued: false,
        }
    }
}

/// Registry of per-provider circuit cells.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    cells: Mutex<HashMap<String, Cell>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Cell>> {
        // Poisoning only means a panicking thread held the lock; the cell
        // data itself stays consistent.
        self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Must be called before every provider request.
    ///
    /// An open circuit whose timeout has elapsed transitions to half-open
    /// and admits exactly one probe; further admissions are denied until
    /// the probe's outcome is recorded.
    pub fn admit(&self, provider: &str) -> Admission {
        let mut cells = self.lock();
        let cell = cells.entry(provider.to_string()).or_insert_with(Cell::new);

        match cell.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = cell.opened_at.map(|t| t.elapsed());
                if elapsed.is_some_and(|e| e >= self.config.open_timeout) {
                    cell.state = CircuitState::HalfOpen;
                    cell.probe_issued = true;
                    tracing::info!(provider, "circuit half-open, admitting probe");
                    Admission::Allowed
                } else {
                    Admission::Denied
                }
            }
            CircuitState::HalfOpen => {
                if cell.probe_issued {
                    Admission::Denied
                } else {
                    cell.probe_issued = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Report the outcome of a provider call.
    pub fn record(&self, provider: &str, outcome: Outcome) {
        let mut cells = self.lock();
        let cell = cells.entry(provider.to_string()).or_insert_with(Cell::new);

        match outcome {
            Outcome::Success => {
                if cell.state != CircuitState::Closed {
                    tracing::info!(provider, "circuit closed after successful probe");
                }
                cell.state = CircuitState::Closed;
                cell.consecutive_failures = 0;
                cell.opened_at = None;
                cell.probe_issued = false;
            }
            Outcome::Failure => match cell.state {
                CircuitState::HalfOpen => {
                    cell.state = CircuitState::Open;
                    cell.opened_at = Some(Instant::now());
                    cell.probe_issued = false;
                    tracing::warn!(provider, "probe failed, circuit re-opened");
                }
                CircuitState::Closed => {
                    cell.consecutive_failures += 1;
                    if cell.consecutive_failures >= self.config.failure_threshold {
                        cell.state = CircuitState::Open;
                        cell.opened_at = Some(Instant::now());
                        tracing::warn!(
                            provider,
                            failures = cell.consecutive_failures,
                            "circuit opened"
                        );
                    }
                }
                // Failures while already open (e.g. a request that was in
                // flight when the circuit tripped) keep it open.
                CircuitState::Open => {}
            },
        }
    }

    /// Non-mutating admission peek.
    ///
    /// Reports whether an [`admit`](Self::admit) call made now would be
    /// allowed, without consuming the half-open probe or moving the cell
    /// between states. Used for pre-checks that happen before the caller
    /// is actually about to issue a provider request; the mutating
    /// `admit` is reserved for the call site that is.
    pub fn would_admit(&self, provider: &str) -> bool {
        let cells = self.lock();
        let Some(cell) = cells.get(provider) else {
            return true;
        };
        match cell.state {
            CircuitState::Closed => true,
            CircuitState::Open => cell
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.open_timeout),
            CircuitState::HalfOpen => !cell.probe_issued,
        }
    }

    /// Current state for a provider (closed if never seen).
    pub fn state(&self, provider: &str) -> CircuitState {
        self.lock()
            .get(provider)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Manually reset a provider's circuit to closed.
    pub fn reset(&self, provider: &str) {
        let mut cells = self.lock();
        if let Some(cell) = cells.get_mut(provider) {
            *cell = Cell::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(threshold: u32, timeout: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            open_timeout: timeout,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let reg = registry(5, Duration::from_secs(60));

        for _ in 0..4 {
            reg.record("anthropic", Outcome::Failure);
            assert_eq!(reg.state("anthropic"), CircuitState::Closed);
        }
        reg.record("anthropic", Outcome::Failure);
        assert_eq!(reg.state("anthropic"), CircuitState::Open);
        assert_eq!(reg.admit("anthropic"), Admission::Denied);
    }

    #[test]
    fn success_resets_failure_count() {
        let reg = registry(3, Duration::from_secs(60));

        reg.record("openai", Outcome::Failure);
        reg.record("openai", Outcome::Failure);
        reg.record("openai", Outcome::Success);
        reg.record("openai", Outcome::Failure);
        reg.record("openai", Outcome::Failure);
        assert_eq!(reg.state("openai"), CircuitState::Closed);
    }

    #[test]
    fn providers_are_independent() {
        let reg = registry(1, Duration::from_secs(60));
        reg.record("groq", Outcome::Failure);
        assert_eq!(reg.state("groq"), CircuitState::Open);
        assert_eq!(reg.admit("xai"), Admission::Allowed);
        assert_eq!(reg.state("xai"), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let reg = registry(1, Duration::from_millis(10));
        reg.record("xai", Outcome::Failure);
        assert_eq!(reg.admit("xai"), Admission::Denied);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(reg.admit("xai"), Admission::Allowed);
        assert_eq!(reg.state("xai"), CircuitState::HalfOpen);
        // Only one probe until its outcome is recorded.
        assert_eq!(reg.admit("xai"), Admission::Denied);

        reg.record("xai", Outcome::Success);
        assert_eq!(reg.state("xai"), CircuitState::Closed);
        assert_eq!(reg.admit("xai"), Admission::Allowed);
    }

    #[test]
    fn failed_probe_reopens() {
        let reg = registry(1, Duration::from_millis(10));
        reg.record("groq", Outcome::Failure);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(reg.admit("groq"), Admission::Allowed);
        reg.record("groq", Outcome::Failure);
        assert_eq!(reg.state("groq"), CircuitState::Open);
        assert_eq!(reg.admit("groq"), Admission::Denied);
    }

    #[test]
    fn would_admit_never_consumes_the_probe() {
        let reg = registry(1, Duration::from_millis(10));
        reg.record("anthropic", Outcome::Failure);

        // Still open: the peek and the real check agree.
        assert!(!reg.would_admit("anthropic"));
        assert_eq!(reg.state("anthropic"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        // Any number of peeks reports the probe as available without
        // taking it or flipping the cell to half-open.
        assert!(reg.would_admit("anthropic"));
        assert!(reg.would_admit("anthropic"));
        assert_eq!(reg.state("anthropic"), CircuitState::Open);

        // The real admit still gets the one probe...
        assert_eq!(reg.admit("anthropic"), Admission::Allowed);
        assert_eq!(reg.state("anthropic"), CircuitState::HalfOpen);
        // ...after which the peek reports it as taken.
        assert!(!reg.would_admit("anthropic"));
        assert_eq!(reg.admit("anthropic"), Admission::Denied);
    }

    #[test]
    fn would_admit_for_unknown_provider() {
        let reg = registry(5, Duration::from_secs(60));
        assert!(reg.would_admit("never-seen"));
    }

    #[test]
    fn manual_reset_closes() {
        let reg = registry(1, Duration::from_secs(60));
        reg.record("anthropic", Outcome::Failure);
        assert_eq!(reg.state("anthropic"), CircuitState::Open);
        reg.reset("anthropic");
        assert_eq!(reg.state("anthropic"), CircuitState::Closed);
        assert_eq!(reg.admit("anthropic"), Admission::Allowed);
    }
}
