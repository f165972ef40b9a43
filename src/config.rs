//! Pipeline configuration
//!
//! Plain config values consumed by the core: per-entity polling, relay
//! interval and named error-handling policies. Argument parsing and wiring
//! live outside this crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Named error-handling policy.
///
/// Applied to malformed/undeserializable change rows and to events with no
/// registered consumer downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Skip the offending row/event silently
    Silent,
    /// Abort the whole batch and surface the error
    Handle,
    /// Complete the batch but mark the cycle result as failed
    CompleteWithError,
    /// Complete the batch, logging the skip
    CompleteAsSilent,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Handle
    }
}

impl ErrorPolicy {
    /// Whether the offending row is dropped rather than aborting the batch.
    pub fn skips_row(&self) -> bool {
        !matches!(self, ErrorPolicy::Handle)
    }
}

/// Per-entity scheduling and policy configuration.
#[derive(Debug, Clone)]
pub struct EntityConfig {
    /// Tracked-entity name; also the lock and tracker key
    pub name: String,
    /// Polling interval for the entity's loop
    pub poll_interval: Duration,
    /// Disabled entities get no loop at all
    pub enabled: bool,
    /// Optional per-cycle timeout; treated as a normal failed cycle
    pub cycle_timeout: Option<Duration>,
    /// Policy for malformed change rows
    pub malformed_row_policy: ErrorPolicy,
    /// Policy for events with no registered consumer
    pub missing_consumer_policy: ErrorPolicy,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval: Duration::from_secs(30),
            enabled: true,
            cycle_timeout: None,
            malformed_row_policy: ErrorPolicy::Handle,
            missing_consumer_policy: ErrorPolicy::Silent,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = Some(timeout);
        self
    }

    pub fn malformed_row_policy(mut self, policy: ErrorPolicy) -> Self {
        self.malformed_row_policy = policy;
        self
    }

    pub fn missing_consumer_policy(mut self, policy: ErrorPolicy) -> Self {
        self.missing_consumer_policy = policy;
        self
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Per-entity loop configuration
    pub entities: Vec<EntityConfig>,
    /// Polling interval for the outbox relay loop
    pub outbox_relay_interval: Duration,
    /// Maximum outbox records relayed per pass
    pub outbox_batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            outbox_relay_interval: Duration::from_millis(500),
            outbox_batch_size: 100,
        }
    }
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Enabled entities only.
    pub fn enabled_entities(&self) -> impl Iterator<Item = &EntityConfig> {
        self.entities.iter().filter(|e| e.enabled)
    }
}

/// Builder for [`RelayConfig`].
#[derive(Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn entity(mut self, entity: EntityConfig) -> Self {
        self.config.entities.push(entity);
        self
    }

    pub fn outbox_relay_interval(mut self, interval: Duration) -> Self {
        self.config.outbox_relay_interval = interval;
        self
    }

    pub fn outbox_batch_size(mut self, size: usize) -> Self {
        self.config.outbox_batch_size = size;
        self
    }

    pub fn build(self) -> RelayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_skips_row() {
        assert!(!ErrorPolicy::Handle.skips_row());
        assert!(ErrorPolicy::Silent.skips_row());
        assert!(ErrorPolicy::CompleteWithError.skips_row());
        assert!(ErrorPolicy::CompleteAsSilent.skips_row());
    }

    #[test]
    fn test_entity_config_builder() {
        let cfg = EntityConfig::new("contact")
            .poll_interval(Duration::from_secs(5))
            .cycle_timeout(Duration::from_secs(60))
            .malformed_row_policy(ErrorPolicy::Silent)
            .enabled(false);

        assert_eq!(cfg.name, "contact");
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.cycle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(cfg.malformed_row_policy, ErrorPolicy::Silent);
        assert!(!cfg.enabled);
    }

    #[test]
    fn test_relay_config_enabled_filter() {
        let config = RelayConfig::builder()
            .entity(EntityConfig::new("contact"))
            .entity(EntityConfig::new("order").enabled(false))
            .outbox_batch_size(50)
            .build();

        let enabled: Vec<_> = config.enabled_entities().map(|e| e.name.as_str()).collect();
        assert_eq!(enabled, vec!["contact"]);
        assert_eq!(config.outbox_batch_size, 50);
    }
}
