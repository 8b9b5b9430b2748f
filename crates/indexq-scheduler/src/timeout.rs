//! Per-run timeout for scheduled jobs.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on a single run. A run that exceeds it is recorded as failed;
/// the next tick still fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Timeout in seconds (0 = unbounded)
    pub timeout_secs: u64,
}

impl TimeoutConfig {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Run `job`, converting an elapsed timeout into an error message.
    pub async fn run<F, T>(&self, job: F) -> Result<T, String>
    where
        F: Future<Output = Result<T, String>>,
    {
        match self.duration() {
            Some(limit) => match tokio::time::timeout(limit, job).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {}s", self.timeout_secs)),
            },
            None => job.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration() {
        assert_eq!(TimeoutConfig::none().duration(), None);
        assert_eq!(
            TimeoutConfig::new(300).duration(),
            Some(Duration::from_secs(300))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let timeout = TimeoutConfig::new(1);
        let result: Result<(), String> = timeout
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err("timed out after 1s".to_string()));
    }

    #[tokio::test]
    async fn test_run_passes_through() {
        let ok = TimeoutConfig::new(5).run(async { Ok::<_, String>(3) }).await;
        assert_eq!(ok, Ok(3));

        let err: Result<(), String> = TimeoutConfig::none()
            .run(async { Err("boom".to_string()) })
            .await;
        assert_eq!(err, Err("boom".to_string()));
    }
}
