use std::time::Duration;

/// Contains configuration options for frame pacing like the in-flight frame limit and wait timeouts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacingConfig {
    /// Presented frames allowed in flight per queue before a present blocks on the oldest one.
    pub sync_pool_depth: usize,
    /// How long a present may block on a fence or on vsync progress before giving up.
    pub fence_timeout: Duration,
    /// Refresh period assumed when the display cannot be queried.
    pub fallback_refresh_duration_ns: u64,
    /// Longest frame time the auto swap interval may pick.
    pub max_auto_swap_interval: Duration,
    pub auto_swap_interval: bool,
    pub auto_pipeline_mode: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            sync_pool_depth: 1,
            fence_timeout: Duration::from_millis(50),
            fallback_refresh_duration_ns: 16_666_666,
            max_auto_swap_interval: Duration::from_millis(50),
            auto_swap_interval: false,
            auto_pipeline_mode: false,
        }
    }
}
