// Per-service circuit breakers driven by health probe outcomes
// Keeps routing away from services that keep failing and re-admits them cautiously

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use dashmap::DashMap;
use mcp_router_common::config::CircuitBreakerConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, the service is treated as unavailable
    Open,
    /// Circuit is half-open, limited probes test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one service's breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub service_name: String,
    pub state: CircuitState,
    pub opened_at: Option<Instant>,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Consecutive successes while half-open
    pub success_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub state_changed_at: Instant,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    opened_at: Option<Instant>,
    failure_count: u32,
    success_count: u32,
    total_failures: u64,
    total_successes: u64,
    half_open_in_flight: u32,
    /// Bumped on every transition; permits of an older generation hold no slot
    generation: u64,
    state_changed_at: Instant,
    vacant_since: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            failure_count: 0,
            success_count: 0,
            total_failures: 0,
            total_successes: 0,
            half_open_in_flight: 0,
            generation: 0,
            state_changed_at: Instant::now(),
            vacant_since: None,
        }
    }

    fn transition(&mut self, service_name: &str, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.state_changed_at = Instant::now();
        self.success_count = 0;
        self.half_open_in_flight = 0;
        self.generation += 1;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                warn!("Circuit breaker opened: service={}, from={}", service_name, from);
            }
            CircuitState::HalfOpen => {
                info!("Circuit breaker half-open: service={}", service_name);
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.failure_count = 0;
                info!("Circuit breaker closed: service={}, from={}", service_name, from);
            }
        }
        metrics::counter!("mcp_router_circuit_transitions_total", "to" => to.as_str())
            .increment(1);
    }
}

/// Circuit breakers keyed by service name, created lazily on first probe.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Breaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether routing must skip the service. Never changes state.
    pub fn is_open(&self, service_name: &str) -> bool {
        self.breakers
            .get(service_name)
            .is_some_and(|b| b.state == CircuitState::Open)
    }

    pub fn state(&self, service_name: &str) -> Option<CircuitBreakerState> {
        self.breakers
            .get(service_name)
            .map(|b| self.snapshot(service_name, &b))
    }

    pub fn states(&self) -> Vec<CircuitBreakerState> {
        self.breakers
            .iter()
            .map(|entry| self.snapshot(entry.key(), entry.value()))
            .collect()
    }

    /// Decide whether a health probe of the service may run.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open here.
    /// An admitted half-open probe holds a slot until its outcome is recorded.
    pub fn before_probe(&self, service_name: &str) -> bool {
        self.admit(service_name).is_some()
    }

    /// Like `before_probe`, but the admission is returned as a permit that
    /// releases its half-open slot when dropped without an outcome.
    pub fn try_probe(&self, service_name: &str) -> Option<ProbePermit<'_>> {
        self.admit(service_name).map(|generation| ProbePermit {
            breakers: self,
            service_name: service_name.to_string(),
            generation,
            settled: false,
        })
    }

    /// Free the half-open slot taken by an abandoned probe. Slots of an
    /// earlier generation were already cleared by the transition.
    fn release_probe(&self, service_name: &str, generation: u64) {
        if let Some(mut breaker) = self.breakers.get_mut(service_name) {
            if breaker.state == CircuitState::HalfOpen && breaker.generation == generation {
                breaker.half_open_in_flight = breaker.half_open_in_flight.saturating_sub(1);
                debug!("Released abandoned half-open probe: service={}", service_name);
            }
        }
    }

    /// Admit a probe, returning the breaker generation it was admitted under.
    fn admit(&self, service_name: &str) -> Option<u64> {
        let mut breaker = self
            .breakers
            .entry(service_name.to_string())
            .or_insert_with(Breaker::new);

        let admitted = match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout() {
                    breaker.transition(service_name, CircuitState::HalfOpen);
                    breaker.half_open_in_flight = 1;
                    true
                } else {
                    debug!(
                        "Probe rejected, circuit open: service={}, elapsed={:?}",
                        service_name, elapsed
                    );
                    false
                }
            }
            CircuitState::HalfOpen => {
                if breaker.half_open_in_flight < self.config.half_open_max_probes {
                    breaker.half_open_in_flight += 1;
                    true
                } else {
                    debug!("Probe rejected, half-open limit reached: service={}", service_name);
                    false
                }
            }
        };

        admitted.then_some(breaker.generation)
    }

    pub fn record_success(&self, service_name: &str) {
        let mut breaker = self
            .breakers
            .entry(service_name.to_string())
            .or_insert_with(Breaker::new);
        breaker.total_successes += 1;

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                breaker.half_open_in_flight = breaker.half_open_in_flight.saturating_sub(1);
                breaker.success_count += 1;
                if breaker.success_count >= self.config.success_threshold {
                    breaker.transition(service_name, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, service_name: &str) {
        let mut breaker = self
            .breakers
            .entry(service_name.to_string())
            .or_insert_with(Breaker::new);
        breaker.total_failures += 1;

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.transition(service_name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                breaker.transition(service_name, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker open, creating it when absent.
    pub fn open_circuit(&self, service_name: &str) {
        let mut breaker = self
            .breakers
            .entry(service_name.to_string())
            .or_insert_with(Breaker::new);
        breaker.transition(service_name, CircuitState::Open);
    }

    /// Force the breaker closed. Unknown services are ignored.
    pub fn close_circuit(&self, service_name: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(service_name) {
            breaker.transition(service_name, CircuitState::Closed);
        }
    }

    /// Close the breaker and clear every counter. Unknown services are ignored.
    pub fn reset_circuit_breaker(&self, service_name: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(service_name) {
            breaker.transition(service_name, CircuitState::Closed);
            breaker.total_failures = 0;
            breaker.total_successes = 0;
        }
    }

    /// Drop breakers of services that have had no instances for longer than the idle grace.
    pub fn sweep(&self, active_services: &HashSet<String>) -> usize {
        let grace = self.config.idle_grace();
        let before = self.breakers.len();

        self.breakers.retain(|service_name, breaker| {
            if active_services.contains(service_name) {
                breaker.vacant_since = None;
                return true;
            }
            let vacant_since = *breaker.vacant_since.get_or_insert_with(Instant::now);
            vacant_since.elapsed() < grace
        });

        let removed = before.saturating_sub(self.breakers.len());
        if removed > 0 {
            info!("Removed {} idle circuit breakers", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn snapshot(&self, service_name: &str, breaker: &Breaker) -> CircuitBreakerState {
        CircuitBreakerState {
            service_name: service_name.to_string(),
            state: breaker.state,
            opened_at: breaker.opened_at,
            failure_count: breaker.failure_count,
            success_count: breaker.success_count,
            total_failures: breaker.total_failures,
            total_successes: breaker.total_successes,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            reset_timeout: self.config.reset_timeout(),
            state_changed_at: breaker.state_changed_at,
        }
    }
}

/// An admitted health probe of one service.
///
/// Report the outcome with `success` or `failure`. Dropping the permit
/// instead, e.g. when the probe future is cancelled, gives back its slot.
pub struct ProbePermit<'a> {
    breakers: &'a CircuitBreakerRegistry,
    service_name: String,
    generation: u64,
    settled: bool,
}

impl ProbePermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breakers.record_success(&self.service_name);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breakers.record_failure(&self.service_name);
    }
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers
                .release_probe(&self.service_name, self.generation);
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout_ms: 1000,
            half_open_max_probes: 2,
            idle_grace_ms: 5000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_to_open_after_threshold() {
        let breakers = registry();
        breakers.record_failure("svc");
        breakers.record_failure("svc");
        assert!(!breakers.is_open("svc"));

        breakers.record_failure("svc");
        assert!(breakers.is_open("svc"));
        let state = breakers.state("svc").unwrap();
        assert_eq!(state.state, CircuitState::Open);
        assert!(state.opened_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_in_closed_resets_failures() {
        let breakers = registry();
        breakers.record_failure("svc");
        breakers.record_failure("svc");
        breakers.record_success("svc");
        breakers.record_failure("svc");
        assert!(!breakers.is_open("svc"));
        assert_eq!(breakers.state("svc").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_probes_until_reset_timeout() {
        let breakers = registry();
        breakers.open_circuit("svc");

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!breakers.before_probe("svc"));
        assert!(breakers.is_open("svc"));

        tokio::time::advance(Duration::from_millis(600)).await;
        // still open for routing until a probe is admitted
        assert!(breakers.is_open("svc"));
        assert!(breakers.before_probe("svc"));
        assert_eq!(breakers.state("svc").unwrap().state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breakers = registry();
        breakers.open_circuit("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(breakers.before_probe("svc"));

        breakers.record_failure("svc");
        assert!(breakers.is_open("svc"));
        // openedAt is reset by the reopen
        assert!(!breakers.before_probe("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_close() {
        let breakers = registry();
        breakers.open_circuit("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;

        assert!(breakers.before_probe("svc"));
        breakers.record_success("svc");
        assert_eq!(breakers.state("svc").unwrap().state, CircuitState::HalfOpen);

        assert!(breakers.before_probe("svc"));
        breakers.record_success("svc");
        let state = breakers.state("svc").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_limit() {
        let breakers = registry();
        breakers.open_circuit("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;

        assert!(breakers.before_probe("svc"));
        assert!(breakers.before_probe("svc"));
        assert!(!breakers.before_probe("svc"));

        breakers.record_success("svc");
        assert!(breakers.before_probe("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_frees_half_open_slot() {
        let breakers = registry();
        breakers.open_circuit("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;

        let first = breakers.try_probe("svc");
        let second = breakers.try_probe("svc");
        assert!(first.is_some() && second.is_some());
        assert!(breakers.try_probe("svc").is_none());

        drop(first);
        let third = breakers.try_probe("svc");
        assert!(third.is_some());
        assert!(breakers.try_probe("svc").is_none());

        second.unwrap().success();
        third.unwrap().success();
        assert_eq!(breakers.state("svc").unwrap().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_does_not_release_newer_slot() {
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            reset_timeout_ms: 1000,
            half_open_max_probes: 1,
            ..Default::default()
        });
        breakers.open_circuit("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;
        let stale = breakers.try_probe("svc");
        assert!(stale.is_some());

        breakers.open_circuit("svc");
        tokio::time::advance(Duration::from_millis(1001)).await;
        let current = breakers.try_probe("svc");
        assert!(current.is_some());

        drop(stale);
        assert!(breakers.try_probe("svc").is_none());
        drop(current);
        assert!(breakers.try_probe("svc").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_overrides_are_safe_from_any_state() {
        let breakers = registry();

        breakers.close_circuit("unknown");
        breakers.reset_circuit_breaker("unknown");
        assert!(breakers.state("unknown").is_none());

        breakers.open_circuit("svc");
        breakers.open_circuit("svc");
        assert!(breakers.is_open("svc"));

        breakers.close_circuit("svc");
        assert!(!breakers.is_open("svc"));

        breakers.record_failure("svc");
        breakers.reset_circuit_breaker("svc");
        let state = breakers.state("svc").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_breakers_after_grace() {
        let breakers = registry();
        breakers.record_failure("gone");
        breakers.record_failure("alive");

        let active: HashSet<String> = ["alive".to_string()].into_iter().collect();
        assert_eq!(breakers.sweep(&active), 0);

        tokio::time::advance(Duration::from_millis(4000)).await;
        assert_eq!(breakers.sweep(&active), 0);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(breakers.sweep(&active), 1);
        assert!(breakers.state("gone").is_none());
        assert!(breakers.state("alive").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_resets_grace_when_service_returns() {
        let breakers = registry();
        breakers.record_failure("svc");

        breakers.sweep(&HashSet::new());
        tokio::time::advance(Duration::from_millis(4000)).await;

        let active: HashSet<String> = ["svc".to_string()].into_iter().collect();
        breakers.sweep(&active);

        tokio::time::advance(Duration::from_millis(4000)).await;
        assert_eq!(breakers.sweep(&HashSet::new()), 0);
        assert_eq!(breakers.len(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(
            serde_json::to_string(&CircuitState::Open).unwrap(),
            "\"OPEN\""
        );
    }
}
