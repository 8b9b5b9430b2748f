//! Start jitter for scheduled runs.
//!
//! Cron jobs fire on exact boundaries; a random delay before each run keeps
//! the drain and the session sweep from always starting together.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum random delay applied before a run.
///
/// ```
/// use indexq_scheduler::JitterConfig;
///
/// let jitter = JitterConfig::new(2);
/// assert!(jitter.generate_jitter() < std::time::Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JitterConfig {
    /// Upper bound in seconds, exclusive (0 = no jitter).
    pub max_jitter_secs: u64,
}

impl JitterConfig {
    pub fn new(max_jitter_secs: u64) -> Self {
        Self { max_jitter_secs }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.max_jitter_secs > 0
    }

    /// A random delay in `[0, max_jitter_secs)` with millisecond resolution.
    pub fn generate_jitter(&self) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }
        let max_ms = self.max_jitter_secs.saturating_mul(1000);
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

/// Sleep for a random jitter, then run `job`.
pub async fn with_jitter<F, T>(jitter: &JitterConfig, job: F) -> T
where
    F: Future<Output = T>,
{
    let delay = jitter.generate_jitter();
    if !delay.is_zero() {
        debug!(jitter_ms = delay.as_millis() as u64, "Delaying run");
        tokio::time::sleep(delay).await;
    }
    job.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_jitter() {
        assert!(!JitterConfig::none().is_enabled());
        assert_eq!(JitterConfig::new(0).generate_jitter(), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_below_bound() {
        let jitter = JitterConfig::new(1);
        let samples: Vec<Duration> = (0..500).map(|_| jitter.generate_jitter()).collect();

        assert!(samples.iter().all(|d| *d < Duration::from_secs(1)));
        let distinct: std::collections::HashSet<u128> =
            samples.iter().map(|d| d.as_millis()).collect();
        assert!(distinct.len() > 1);
    }

    #[tokio::test]
    async fn test_with_jitter_runs_job() {
        let value = with_jitter(&JitterConfig::none(), async { 7 }).await;
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_jitter_waits_on_tokio_clock() {
        let start = tokio::time::Instant::now();
        with_jitter(&JitterConfig::new(1), async {}).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
