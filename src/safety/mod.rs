//! Policy guards for tool execution: path containment, SSRF classification,
//! command gating, and size/time caps. All guards are pure and deterministic;
//! enforcement (timeouts, truncation) lives in the tool runtime.

pub mod command;
pub mod net;
pub mod path;

use std::time::Duration;

pub const DEFAULT_MAX_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Size and wall-clock caps applied to every tool invocation.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_bytes: usize,
    pub timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}
