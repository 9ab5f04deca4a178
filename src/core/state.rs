use std::time::Duration;
use crate::core::config::PacingConfig;

// Frame times this close past a refresh multiple still count as that multiple
const SWAP_INTERVAL_MARGIN_NS: u64 = 500;

/// Whether CPU and GPU work of consecutive frames overlap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PipelineMode {
    /// Plan two intervals ahead: one for the CPU, one for the GPU.
    #[default]
    On,
    /// CPU and GPU together fit in one interval.
    Off,
}

/// Contains often-mutated pacing parameters for one logical device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacingState {
    pub refresh_duration_ns: u64,
    /// Refresh periods between presented frames, at least 1.
    pub swap_interval: u32,
    /// Frame duration the application asked for.
    pub swap_interval_ns: u64,
    pub auto_swap_interval: bool,
    pub auto_pipeline_mode: bool,
    pub pipeline_mode: PipelineMode,
    pub fence_timeout: Duration,
}

impl PacingState {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            refresh_duration_ns: config.fallback_refresh_duration_ns,
            swap_interval: 1,
            swap_interval_ns: config.fallback_refresh_duration_ns,
            auto_swap_interval: config.auto_swap_interval,
            auto_pipeline_mode: config.auto_pipeline_mode,
            pipeline_mode: PipelineMode::On,
            fence_timeout: config.fence_timeout,
        }
    }

    /// Swap interval the application's requested frame duration maps to.
    pub fn requested_swap_interval(&self) -> u32 {
        swap_interval_for(self.swap_interval_ns, self.refresh_duration_ns)
    }

    pub fn set_refresh_duration(&mut self, refresh_duration_ns: u64) {
        self.refresh_duration_ns = refresh_duration_ns.max(1);
        self.apply_requested_interval();
    }

    pub fn set_swap_interval_ns(&mut self, swap_interval_ns: u64) {
        self.swap_interval_ns = swap_interval_ns;
        self.apply_requested_interval();
    }

    fn apply_requested_interval(&mut self) {
        let requested = self.requested_swap_interval();
        // The auto controller never goes below what the application asked for
        if !self.auto_swap_interval || self.swap_interval < requested {
            self.swap_interval = requested;
        }
    }

    pub fn set_auto_swap_interval(&mut self, enabled: bool) {
        self.auto_swap_interval = enabled;
        if !enabled {
            self.swap_interval = self.requested_swap_interval();
            self.pipeline_mode = PipelineMode::On;
        }
    }

    pub fn set_auto_pipeline_mode(&mut self, enabled: bool) {
        self.auto_pipeline_mode = enabled;
        if !enabled {
            self.pipeline_mode = PipelineMode::On;
        }
    }

    /// Time between two presented frames.
    pub fn frame_budget_ns(&self) -> u64 {
        self.refresh_duration_ns.saturating_mul(u64::from(self.swap_interval))
    }
}

/// Number of refresh periods a frame of `frame_ns` occupies.
pub fn swap_interval_for(frame_ns: u64, refresh_ns: u64) -> u32 {
    if refresh_ns == 0 || frame_ns < refresh_ns {
        return 1;
    }

    let whole = frame_ns / refresh_ns;
    let extra = u64::from(frame_ns % refresh_ns > SWAP_INTERVAL_MARGIN_NS);
    u32::try_from(whole + extra).unwrap_or(u32::MAX)
}
