//! Retry classification and a per-dependency circuit breaker.
//!
//! The classification helpers below are a direct generalization of the
//! provider-retry heuristics the LLM client used for fallback routing:
//! status-code checks plus substring matching on error text for rate
//! limits, transient 5xx responses, and empty/malformed bodies. Unlike
//! that model-specific retry loop, [`Resilience`] wraps any async
//! operation and layers a closed/open/half-open breaker on top, so MCP
//! calls, container spawns, and channel-adapter sends can all share it.

use crate::config::ResilienceConfig;
use crate::error::{Error, ResilienceError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Whether an HTTP status code should trigger a retry.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// Whether an error message indicates a transient, retriable failure.
pub fn is_retriable_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("529")
        || lower.contains("rate limit")
        || lower.contains("overloaded")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("empty response")
        || lower.contains("failed to read response body")
        || lower.contains("error decoding response body")
}

/// Whether an error message specifically indicates a rate limit (429 /
/// "rate limit" / "too many requests"), distinct from a general transient
/// failure — used to decide whether to honor a `Retry-After` hint.
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[cfg(feature = "metrics")]
fn record_breaker_state_metric(label: &str, state: BreakerState) {
    let value = match state {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    };
    crate::metrics::Metrics::global()
        .breaker_state
        .with_label_values(&[label])
        .set(value);
}

#[cfg(not(feature = "metrics"))]
fn record_breaker_state_metric(_label: &str, _state: BreakerState) {}

struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<chrono::DateTime<chrono::Utc>>,
    half_open_successes: u32,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_successes: 0,
        }
    }
}

/// Outcome of a single [`Resilience::execute`] call, for observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attempt {
    pub tries: u32,
}

/// Shared retry + circuit-breaker executor, keyed by an arbitrary label
/// (model name, MCP server name, adapter name, ...). One instance is
/// shared across the process; breakers for distinct labels never interact.
pub struct Resilience {
    config: ResilienceConfig,
    breakers: Mutex<HashMap<String, BreakerEntry>>,
}

impl Resilience {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op`, retrying transient failures with jittered exponential
    /// backoff (honoring `retry_after` when the failure supplies one), and
    /// refusing to call `op` at all while `label`'s breaker is open.
    pub async fn execute<F, Fut, T>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ResilienceOutcome>>,
    {
        self.check_breaker(label)?;

        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    self.record_success(label);
                    return Ok(value);
                }
                Err(outcome) => {
                    let retriable = outcome.retriable;
                    if !retriable || attempt > self.config.max_retries {
                        // Only a retriable failure that exhausted its retries counts
                        // against the breaker; a fatal error (bad request, invalid
                        // key, ...) isn't the dependency's fault and propagates
                        // immediately without tripping it.
                        if retriable {
                            self.record_failure(label);
                        }
                        let source = outcome.error;
                        return Err(ResilienceError::RetriesExhausted {
                            label: label.to_string(),
                            attempts: attempt,
                            source: Box::new(source),
                        }
                        .into());
                    }
                    let delay = outcome
                        .retry_after
                        .unwrap_or_else(|| self.backoff_delay(attempt));
                    tracing::debug!(label, attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let exp = base * 2f64.powi(attempt as i32 - 1);
        let capped = exp.min(self.config.max_delay_ms as f64);
        let jitter = capped * self.config.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    fn check_breaker(&self, label: &str) -> Result<()> {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers.entry(label.to_string()).or_default();
        if entry.state == BreakerState::Open {
            let opened_at = entry.opened_at.unwrap_or_else(chrono::Utc::now);
            let elapsed = chrono::Utc::now() - opened_at;
            if elapsed.num_milliseconds() >= self.config.reset_timeout_ms as i64 {
                entry.state = BreakerState::HalfOpen;
                entry.half_open_successes = 0;
                record_breaker_state_metric(label, entry.state);
            } else {
                return Err(ResilienceError::CircuitOpen {
                    label: label.to_string(),
                    opened_at,
                }
                .into());
            }
        }
        Ok(())
    }

    fn record_success(&self, label: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers.entry(label.to_string()).or_default();
        match entry.state {
            BreakerState::HalfOpen => {
                entry.half_open_successes += 1;
                if entry.half_open_successes >= self.config.half_open_success_threshold {
                    entry.state = BreakerState::Closed;
                    entry.consecutive_failures = 0;
                    entry.opened_at = None;
                    record_breaker_state_metric(label, entry.state);
                }
            }
            BreakerState::Closed => {
                entry.consecutive_failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self, label: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers.entry(label.to_string()).or_default();
        match entry.state {
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(chrono::Utc::now());
                entry.half_open_successes = 0;
                record_breaker_state_metric(label, entry.state);
            }
            BreakerState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.failure_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(chrono::Utc::now());
                    record_breaker_state_metric(label, entry.state);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current breaker state label, for status reporting (`"closed"` /
    /// `"open"` / `"half_open"`) — never constructs a breaker entry for a
    /// label that hasn't been seen yet.
    pub fn breaker_status(&self, label: &str) -> &'static str {
        let breakers = self.breakers.lock().unwrap();
        match breakers.get(label).map(|e| e.state) {
            None | Some(BreakerState::Closed) => "closed",
            Some(BreakerState::Open) => "open",
            Some(BreakerState::HalfOpen) => "half_open",
        }
    }
}

/// What a failed attempt inside [`Resilience::execute`] reports back: the
/// underlying error, whether it's worth retrying, and an optional
/// `Retry-After`-derived delay to use instead of the computed backoff.
pub struct ResilienceOutcome {
    pub error: Error,
    pub retriable: bool,
    pub retry_after: Option<Duration>,
}

impl ResilienceOutcome {
    pub fn fatal(error: Error) -> Self {
        Self {
            error,
            retriable: false,
            retry_after: None,
        }
    }

    pub fn retriable(error: Error) -> Self {
        Self {
            error,
            retriable: true,
            retry_after: None,
        }
    }

    pub fn retriable_after(error: Error, retry_after: Duration) -> Self {
        Self {
            error,
            retriable: true,
            retry_after: Some(retry_after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> ResilienceConfig {
        ResilienceConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
            failure_threshold: 2,
            reset_timeout_ms: 20,
            half_open_success_threshold: 1,
        }
    }

    #[test]
    fn classifies_rate_limit_and_server_errors_as_retriable() {
        assert!(is_retriable_status(429));
        assert!(is_retriable_status(500));
        assert!(is_retriable_status(503));
        assert!(is_retriable_status(529));
        assert!(!is_retriable_status(400));
        assert!(is_retriable_error("Rate limit exceeded"));
        assert!(is_retriable_error("upstream returned 503"));
        assert!(is_retriable_error("Anthropic API error (500 internal server error)"));
        assert!(!is_retriable_error("invalid api key"));
    }

    #[tokio::test]
    async fn fatal_errors_do_not_count_against_the_breaker() {
        let r = Resilience::new(fast_config());

        for _ in 0..10 {
            let _ = r
                .execute("svc", move || async move {
                    Err::<(), _>(ResilienceOutcome::fatal(
                        crate::error::AgentError::Cancelled {
                            reason: "invalid api key".into(),
                        }
                        .into(),
                    ))
                })
                .await;
        }

        assert_eq!(r.breaker_status("svc"), "closed");
    }

    #[tokio::test]
    async fn breaker_trips_after_threshold_and_recovers_after_cooldown() {
        let r = Resilience::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let _ = r
                .execute("svc", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceOutcome::retriable(
                            crate::error::AgentError::Cancelled {
                                reason: "boom".into(),
                            }
                            .into(),
                        ))
                    }
                })
                .await;
        }

        // Breaker is now open: further calls are rejected without invoking op.
        let before = calls.load(Ordering::SeqCst);
        let result = r
            .execute("svc", {
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ResilienceOutcome>(())
                    }
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert_eq!(r.breaker_status("svc"), "open");

        tokio::time::sleep(Duration::from_millis(25)).await;

        let result = r
            .execute("svc", move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceOutcome>(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(r.breaker_status("svc"), "closed");
    }
}
