//! Runtime defaults for a swarm.
//!
//! Provides the [`SwarmDefaults`] struct holding the tunable knobs shared
//! by every agent in a swarm: capacity limits, retry behaviour, context
//! compression thresholds, and the external-hook timeout.  Users construct
//! it manually — no file parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use swarmsdk::config::SwarmDefaults;
//!
//! // The stock defaults
//! let defaults = SwarmDefaults::default();
//! assert_eq!(defaults.global_capacity, 50);
//!
//! // Or tighten a few knobs
//! let defaults = SwarmDefaults {
//!     global_capacity: 8,
//!     local_capacity: 4,
//!     ..SwarmDefaults::default()
//! };
//! ```

use std::time::Duration;

/// Tunable defaults applied to every agent in a swarm unless overridden on
/// the agent definition.
#[derive(Debug, Clone)]
pub struct SwarmDefaults {
    /// Maximum concurrent in-flight LLM requests across the swarm tree.
    pub global_capacity: usize,
    /// Maximum concurrent tool executions within one agent turn.
    pub local_capacity: usize,
    /// LLM retry attempts for retryable failures (429/5xx/network).
    pub retry_attempts: usize,
    /// Fixed delay between LLM retries.
    pub retry_delay: Duration,
    /// Fraction of the model context window at which the runtime warns and
    /// compresses old tool results.
    pub compression_threshold: f64,
    /// Number of most recent messages exempt from compression.
    pub recent_tail: usize,
    /// Wall-clock limit for external-command hooks.
    pub hook_timeout: Duration,
}

impl Default for SwarmDefaults {
    fn default() -> Self {
        SwarmDefaults {
            global_capacity: 50,
            local_capacity: 10,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(15),
            compression_threshold: 0.6,
            recent_tail: 10,
            hook_timeout: Duration::from_secs(30),
        }
    }
}
