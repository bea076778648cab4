//! Runtime configuration for a [`DddContext`](crate::context::DddContext).
//!
//! Configuration is a plain value: build it with `Default` plus the `with_*`
//! setters, or deserialize it with serde. Every process of a run must use the
//! same `tree_degree`, since the spanning tree is implied by it.

use crate::ddd_error::DddError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default capacity of the notify info buffer (entries).
pub const DEFAULT_NOTIFY_MAX_INFOS: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DddConfig {
    /// Fan-out of the spanning tree used by notify and reductions.
    pub tree_degree: usize,
    /// Maximum number of info records one process may hold during a notify wave.
    pub notify_max_infos: usize,
    /// Upper bound for any busy-poll loop; `None` polls forever.
    pub poll_timeout: Option<Duration>,
    /// Byte budget for outgoing message buffers; `None` means unbounded heap.
    pub send_memory_limit: Option<usize>,
    /// Cross-check every pair of couplings, not only owner/holder pairs.
    pub strict_consistency: bool,
}

impl Default for DddConfig {
    fn default() -> Self {
        Self {
            tree_degree: 2,
            notify_max_infos: DEFAULT_NOTIFY_MAX_INFOS,
            poll_timeout: None,
            send_memory_limit: None,
            strict_consistency: false,
        }
    }
}

impl DddConfig {
    pub fn with_tree_degree(mut self, degree: usize) -> Self {
        self.tree_degree = degree;
        self
    }

    pub fn with_notify_max_infos(mut self, n: usize) -> Self {
        self.notify_max_infos = n;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn with_send_memory_limit(mut self, bytes: usize) -> Self {
        self.send_memory_limit = Some(bytes);
        self
    }

    pub fn with_strict_consistency(mut self, strict: bool) -> Self {
        self.strict_consistency = strict;
        self
    }

    /// Reject settings the protocols cannot run with.
    pub fn validate(&self) -> Result<(), DddError> {
        if self.tree_degree == 0 {
            return Err(DddError::InvalidConfig("tree_degree must be at least 1".into()));
        }
        if self.notify_max_infos == 0 {
            return Err(DddError::InvalidConfig(
                "notify_max_infos must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(DddConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_degree_rejected() {
        let cfg = DddConfig::default().with_tree_degree(0);
        assert!(matches!(cfg.validate(), Err(DddError::InvalidConfig(_))));
    }

    #[test]
    fn serde_round_trip_and_defaults() {
        let cfg = DddConfig::default()
            .with_tree_degree(4)
            .with_poll_timeout(Duration::from_millis(250));
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DddConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);

        let partial: DddConfig = serde_json::from_str(r#"{"strict_consistency":true}"#).unwrap();
        assert!(partial.strict_consistency);
        assert_eq!(partial.tree_degree, 2);
    }
}
