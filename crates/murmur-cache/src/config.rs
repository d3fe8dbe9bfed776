//! Sync timing and policy configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of network the client runs on. Picks timing presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    #[default]
    Desktop,
    Mobile,
}

impl FromStr for NetworkClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(NetworkClass::Desktop),
            "mobile" => Ok(NetworkClass::Mobile),
            other => Err(format!("unknown network class: {}", other)),
        }
    }
}

/// What deleting a parent record does to its children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Children are deleted with the parent.
    #[default]
    Cascade,
    /// Children are kept and point at a missing parent.
    Orphan,
    /// Deleting a parent with children fails.
    Reject,
}

/// Timing and policy knobs for caches and the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Upper bound on a single remote call.
    pub fetch_timeout: Duration,
    /// Delay before the single retry of a failed reconcile.
    pub retry_delay: Duration,
    /// Change notices arriving within this window trigger one reconcile.
    pub settle_delay: Duration,
    /// Interval of the background polling reconcile.
    pub polling_interval: Duration,
    /// Maximum rows fetched per collection.
    pub fetch_limit: usize,
    /// Synthesize a guest author when nobody is signed in.
    pub allow_placeholder_author: bool,
    pub delete_policy: DeletePolicy,
}

impl SyncConfig {
    /// Preset for a network class.
    pub fn for_network(class: NetworkClass) -> Self {
        let fetch_timeout = match class {
            NetworkClass::Desktop => Duration::from_secs(8),
            NetworkClass::Mobile => Duration::from_secs(10),
        };
        Self {
            fetch_timeout,
            retry_delay: Duration::from_secs(5),
            settle_delay: Duration::from_millis(300),
            polling_interval: Duration::from_secs(20),
            fetch_limit: 500,
            allow_placeholder_author: true,
            delete_policy: DeletePolicy::Cascade,
        }
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn with_placeholder_author(mut self, allow: bool) -> Self {
        self.allow_placeholder_author = allow;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::for_network(NetworkClass::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let desktop = SyncConfig::for_network(NetworkClass::Desktop);
        let mobile = SyncConfig::for_network(NetworkClass::Mobile);
        assert_eq!(desktop.fetch_timeout, Duration::from_secs(8));
        assert_eq!(mobile.fetch_timeout, Duration::from_secs(10));
        assert_eq!(desktop.retry_delay, mobile.retry_delay);
        assert_eq!(desktop.delete_policy, DeletePolicy::Cascade);
    }

    #[test]
    fn test_network_class_parse() {
        assert_eq!("Mobile".parse::<NetworkClass>(), Ok(NetworkClass::Mobile));
        assert!("satellite".parse::<NetworkClass>().is_err());
    }
}
