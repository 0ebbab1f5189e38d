use std::time::Duration;

use kubemux_queue::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Dispatcher settings. In-memory only; nothing is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Retries after the first failed attempt. Negative means retry forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Concurrent consumers. Distinct items run in parallel; one item never does.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Minimum spacing between re-entries of a worker's drain loop (unit: milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up on the initial sync barrier after this long; unset waits forever
    #[serde(default)]
    pub sync_timeout_ms: Option<u64>,

    /// Fail a handler call that runs longer than this; unset never times out
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffPolicy::default(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            sync_timeout_ms: None,
            handler_timeout_ms: None,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    /// Whether an item that failed `retries` times so far gets another attempt.
    pub fn should_retry(&self, retries: usize) -> bool {
        self.max_retries < 0 || (retries as i64) < self.max_retries
    }
}

fn default_max_retries() -> i64 {
    5
}
fn default_workers() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget() {
        let mut c = DispatcherConfig { max_retries: 2, ..Default::default() };
        assert!(c.should_retry(0));
        assert!(c.should_retry(1));
        assert!(!c.should_retry(2));
        c.max_retries = 0;
        assert!(!c.should_retry(0));
        c.max_retries = -1;
        assert!(c.should_retry(usize::MAX / 2));
    }

    #[test]
    fn deserializes_partial_config() {
        let c: DispatcherConfig = serde_json::from_str(r#"{"max_retries": -1, "backoff": {"base_delay_ms": 20}}"#).unwrap();
        assert_eq!(c.max_retries, -1);
        assert_eq!(c.backoff.base_delay_ms, 20);
        assert_eq!(c.workers, 1);
        assert_eq!(c.poll_interval(), Duration::from_secs(1));
        assert!(c.sync_timeout().is_none());
    }
}
