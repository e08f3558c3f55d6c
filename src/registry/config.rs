//! Registry configuration

use std::time::Duration;

/// Default delay between the last detach and teardown
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default number of updates buffered for subscribers that fall behind
pub const DEFAULT_UPDATE_CAPACITY: usize = 64;

/// When an entry subscribes to its source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribePolicy {
    /// Subscribe as soon as the entry is created
    #[default]
    Eager,
    /// Subscribe on the first attach
    Lazy,
}

/// Registry configuration options
///
/// Every entry copies the configuration of the registry that created it.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an entry without subscribers survives before teardown
    pub grace_period: Duration,

    /// Eager or lazy source subscription
    pub subscribe_policy: SubscribePolicy,

    /// Updates kept for subscribers that are not receiving
    ///
    /// A subscriber further behind than this skips ahead and is told how many
    /// updates it missed. Reads always see the latest state.
    pub update_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            subscribe_policy: SubscribePolicy::Eager,
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Set the grace period
    pub fn grace_period(mut self, period: Duration) -> Self {
        self.grace_period = period;
        self
    }

    /// Set the subscribe policy
    pub fn subscribe_policy(mut self, policy: SubscribePolicy) -> Self {
        self.subscribe_policy = policy;
        self
    }

    /// Set the per-entry update buffer size (at least 1)
    pub fn update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = capacity.max(1);
        self
    }

    /// Defer source subscription until the first attach
    pub fn lazy(self) -> Self {
        self.subscribe_policy(SubscribePolicy::Lazy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();

        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.subscribe_policy, SubscribePolicy::Eager);
        assert_eq!(config.update_capacity, DEFAULT_UPDATE_CAPACITY);
    }

    #[test]
    fn test_builder_update_capacity() {
        assert_eq!(RegistryConfig::default().update_capacity(8).update_capacity, 8);
        assert_eq!(RegistryConfig::default().update_capacity(0).update_capacity, 1);
    }

    #[test]
    fn test_builder_grace_period() {
        let config = RegistryConfig::default().grace_period(Duration::from_millis(1000));

        assert_eq!(config.grace_period, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_lazy() {
        let config = RegistryConfig::default().lazy();

        assert_eq!(config.subscribe_policy, SubscribePolicy::Lazy);
    }

    #[test]
    fn test_builder_chaining() {
        let config = RegistryConfig::default()
            .subscribe_policy(SubscribePolicy::Lazy)
            .grace_period(Duration::from_secs(5))
            .subscribe_policy(SubscribePolicy::Eager);

        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.subscribe_policy, SubscribePolicy::Eager);
    }
}
