//! Upstream endpoint constants and reconnection backoff policy.

use std::time::Duration;

/// WebSocket URL for the realtime streaming endpoint. The model is appended
/// as a query parameter.
pub const REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";

/// REST endpoint that mints ephemeral client credentials.
pub const REALTIME_SESSIONS_URL: &str = "https://api.openai.com/v1/realtime/sessions";

/// Beta header required by the realtime endpoint.
pub const REALTIME_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "realtime=v1");

/// Idle deadline on the upstream socket before the connection is considered
/// lost and reconnection kicks in.
pub const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff policy for upstream reconnection.
///
/// Attempts are unlimited by default (`max_attempts == 0`); reconnection only
/// stops when the client leg goes away.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Ceiling on the computed delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt.
    pub multiplier: f64,

    /// Add up to +/-25% jitter to spread retries out.
    pub jitter: bool,

    /// Maximum attempts, 0 for unlimited.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            max_attempts: 0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let delay = base * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        let millis = if self.jitter {
            let jitter_range = delay * 0.25;
            (delay + rand_jitter(jitter_range)).max(0.0) as u64
        } else {
            delay as u64
        };
        Duration::from_millis(millis)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Generate a pseudo-random jitter value using a simple LCG.
/// This avoids pulling in the rand crate for a simple use case.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(30000));
        assert_eq!(policy.delay_for(20), Duration::from_millis(30000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_for(1).as_millis() as u64;
        assert!((750..=1250).contains(&delay), "delay {delay} out of range");
    }

    #[test]
    fn test_unlimited_attempts_by_default() {
        let policy = BackoffPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(10_000));
        assert!(policy.should_retry(u32::MAX));
    }

    #[test]
    fn test_bounded_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
