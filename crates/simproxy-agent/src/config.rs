//! Agent proxy configuration

use crate::say::SayPolicy;
use std::time::Duration;

/// Longest time between forwarding a server message and sending a sync on
/// the agent's behalf
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_wait: Duration,
    pub say_policy: SayPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            say_policy: SayPolicy::default(),
        }
    }
}
