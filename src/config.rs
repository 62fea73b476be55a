//! Controller configuration
//!
//! Everything here is read once at startup and never mutated afterwards.
//! Components receive the pieces they need through their constructors.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default prefix for labels derived from asset tags and hardware features
pub const DEFAULT_TAG_PREFIX: &str = "isecl.";

/// Maximum length of a label name segment
const MAX_PREFIX_LEN: usize = 63;

/// Validated prefix prepended to every trust label the controller owns.
///
/// Stale-label cleanup deletes any node label starting with this prefix, so an
/// empty or overly broad value would wipe unrelated labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagPrefix(String);

impl TagPrefix {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a label key owned by this prefix
    pub fn label(&self, name: &str) -> String {
        format!("{}{}", self.0, name)
    }

    /// Whether a label key falls under this prefix
    pub fn owns(&self, key: &str) -> bool {
        key.starts_with(&self.0)
    }
}

impl FromStr for TagPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::ConfigError("tag prefix must not be empty".to_string()));
        }
        if s.len() > MAX_PREFIX_LEN {
            return Err(Error::ConfigError(format!(
                "tag prefix '{}' is longer than {} characters",
                s, MAX_PREFIX_LEN
            )));
        }
        if !s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::ConfigError(format!(
                "tag prefix '{}' must start with an alphanumeric character",
                s
            )));
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/')))
        {
            return Err(Error::ConfigError(format!(
                "tag prefix '{}' contains invalid character '{}'",
                s, bad
            )));
        }
        if s.matches('/').count() > 1 {
            return Err(Error::ConfigError(format!(
                "tag prefix '{}' may contain at most one '/'",
                s
            )));
        }
        Ok(TagPrefix(s.to_string()))
    }
}

impl Default for TagPrefix {
    fn default() -> Self {
        TagPrefix(DEFAULT_TAG_PREFIX.to_string())
    }
}

impl fmt::Display for TagPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Taint and labelling policy shared by the trust and node-event paths
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerPolicy {
    /// Taint nodes whose attested host is untrusted
    pub taint_untrusted_nodes: bool,
    /// Taint nodes when they register with the cluster
    pub taint_registered_nodes: bool,
    /// Taint nodes when they report a reboot
    pub taint_rebooted_nodes: bool,
    pub tag_prefix: TagPrefix,
}

/// Retry backoff for the reconciliation queues
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrySettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Full runtime configuration of the controller process
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace holding the HostAttributes objects
    pub namespace: String,
    /// Concurrent workers draining the HostAttributes queue
    pub workers: usize,
    pub policy: ControllerPolicy,
    pub retry: RetrySettings,
    /// Only run while holding the leader lease
    pub leader_election: bool,
    /// Port of the health and metrics endpoint
    pub http_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            workers: 1,
            policy: ControllerPolicy::default(),
            retry: RetrySettings::default(),
            leader_election: false,
            http_port: 8080,
        }
    }
}

impl ControllerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::ConfigError("namespace must not be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::ConfigError(
                "at least one worker is required".to_string(),
            ));
        }
        if self.retry.base_delay.is_zero() || self.retry.max_delay < self.retry.base_delay {
            return Err(Error::ConfigError(format!(
                "invalid retry backoff: base {:?}, max {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        Ok(())
    }
}
