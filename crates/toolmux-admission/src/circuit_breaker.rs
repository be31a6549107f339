use dashmap::DashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use toolmux_core::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    threshold: u32,
    cooldown: Duration,
}

impl Breaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            threshold,
            cooldown,
        }
    }

    /// Transitions `open -> half-open` if the cooldown has elapsed. Must be
    /// called under the breaker's lock before deciding admission.
    fn refresh(&mut self) {
        if self.state == BreakerState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = false;
                }
            }
        }
    }
}

/// Per-downstream-server failure-state machine with a half-open probe.
/// Transitions are guarded by a per-server lock (the `stats-update` named
/// mutex made explicit), so breakers for different servers never contend.
pub struct CircuitBreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    breakers: DashMap<String, StdMutex<Breaker>>,
}

pub enum Admission {
    Proceed,
    Probe,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown: Duration::from_millis(cooldown_ms),
            breakers: DashMap::new(),
        }
    }

    fn entry(&self, server: &str) -> dashmap::mapref::one::Ref<'_, String, StdMutex<Breaker>> {
        self.breakers
            .entry(server.to_string())
            .or_insert_with(|| StdMutex::new(Breaker::new(self.threshold, self.cooldown)))
            .downgrade()
    }

    /// Runs `thunk` if the breaker currently admits calls; otherwise fails
    /// fast with `CircuitOpen`. In `half-open`, at most one concurrent
    /// probe is allowed — additional callers are rejected until the probe
    /// resolves.
    pub async fn execute<F, Fut, T, E>(&self, server: &str, thunk: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let admission = {
            let entry = self.entry(server);
            let mut breaker = entry.lock().expect("circuit breaker mutex poisoned");
            breaker.refresh();
            match breaker.state {
                BreakerState::Closed => Admission::Proceed,
                BreakerState::Open => {
                    return Err(OrchestratorError::CircuitOpen {
                        server: server.to_string(),
                    });
                }
                BreakerState::HalfOpen => {
                    if breaker.probe_in_flight {
                        return Err(OrchestratorError::CircuitOpen {
                            server: server.to_string(),
                        });
                    }
                    breaker.probe_in_flight = true;
                    Admission::Probe
                }
            }
        };

        let result = thunk().await;

        let entry = self.entry(server);
        let mut breaker = entry.lock().expect("circuit breaker mutex poisoned");
        match (&admission, &result) {
            (_, Ok(_)) => {
                breaker.consecutive_failures = 0;
                breaker.state = BreakerState::Closed;
                breaker.opened_at = None;
                breaker.probe_in_flight = false;
            }
            (Admission::Probe, Err(_)) => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.probe_in_flight = false;
            }
            (Admission::Proceed, Err(_)) => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= breaker.threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
        }

        result.map_err(|err| OrchestratorError::DownstreamFailure {
            message: err.to_string(),
        })
    }

    pub fn state_of(&self, server: &str) -> BreakerState {
        let entry = self.entry(server);
        let mut breaker = entry.lock().expect("circuit breaker mutex poisoned");
        breaker.refresh();
        breaker.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let registry = CircuitBreakerRegistry::new(3, 30_000);
        for _ in 0..3 {
            let _ = registry
                .execute("srv-2", || async { Err::<(), String>("boom".to_string()) })
                .await;
        }
        assert_eq!(registry.state_of("srv-2"), BreakerState::Open);
        let result = registry.execute("srv-2", || async { Ok::<(), String>(()) }).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_breaker() {
        let registry = CircuitBreakerRegistry::new(1, 10);
        let _ = registry.execute("srv-3", || async { Err::<(), String>("boom".to_string()) }).await;
        assert_eq!(registry.state_of("srv-3"), BreakerState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.state_of("srv-3"), BreakerState::HalfOpen);
        let result = registry.execute("srv-3", || async { Ok::<(), String>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(registry.state_of("srv-3"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_and_resets_cooldown() {
        let registry = CircuitBreakerRegistry::new(1, 10);
        let _ = registry.execute("srv-4", || async { Err::<(), String>("boom".to_string()) }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.state_of("srv-4"), BreakerState::HalfOpen);
        let _ = registry
            .execute("srv-4", || async { Err::<(), String>("boom".to_string()) })
            .await;
        assert_eq!(registry.state_of("srv-4"), BreakerState::Open);
    }

    #[tokio::test]
    async fn independent_servers_do_not_share_breaker_state() {
        let registry = CircuitBreakerRegistry::new(1, 30_000);
        let _ = registry.execute("srv-a", || async { Err::<(), String>("boom".to_string()) }).await;
        assert_eq!(registry.state_of("srv-a"), BreakerState::Open);
        assert_eq!(registry.state_of("srv-b"), BreakerState::Closed);
    }
}
