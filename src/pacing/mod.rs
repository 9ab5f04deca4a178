/// "Pacing" holds the strategies deciding when each frame should reach the display.
/// One strategy instance serves every swapchain of a logical device and is picked once,
/// from what the device and platform can do.

pub mod auto_swap;
pub mod display_timing;
pub mod fallback;
pub mod fence_wait;
pub mod timeline;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Report;
use crate::core::state::PacingState;
use crate::internals::clock::Clock;
use crate::pacing::timeline::Timelines;
use crate::vk::{PacingDevice, PresentInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// No timing extension: assumed 60 Hz, presents forwarded untouched.
    Fallback,
    /// VK_GOOGLE_display_timing with feedback nudges from past presents.
    DisplayTiming,
    /// VK_GOOGLE_display_timing anchored to platform vsync, with bounded in-flight frames.
    FenceWait,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Fallback => "fallback",
            StrategyKind::DisplayTiming => "display timing",
            StrategyKind::FenceWait => "display timing with fence wait",
        };
        f.write_str(name)
    }
}

/// State every strategy carries.
pub struct PacingCore {
    device: Arc<dyn PacingDevice>,
    clock: Arc<dyn Clock>,
    state: Mutex<PacingState>,
    timelines: Mutex<Timelines>,
}

impl PacingCore {
    pub fn new(
        device: Arc<dyn PacingDevice>,
        clock: Arc<dyn Clock>,
        state: PacingState,
        first_present_id: u32,
    ) -> Self {
        Self {
            device,
            clock,
            state: Mutex::new(state),
            timelines: Mutex::new(Timelines::new(first_present_id)),
        }
    }

    pub fn device(&self) -> &Arc<dyn PacingDevice> {
        &self.device
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn state(&self) -> MutexGuard<'_, PacingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timelines(&self) -> MutexGuard<'_, Timelines> {
        self.timelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks the display for its refresh period and adopts it.
    pub fn query_refresh_duration(&self, swapchain: vk::SwapchainKHR) -> VkResult<u64> {
        let refresh_duration_ns = self.device.refresh_cycle_duration(swapchain)?;
        let mut state = self.state();
        if state.refresh_duration_ns != refresh_duration_ns {
            log::info!(
                "Display refresh period is {:.3} ms",
                refresh_duration_ns as f64 / 1e6
            );
        }
        state.set_refresh_duration(refresh_duration_ns);
        Ok(state.refresh_duration_ns)
    }
}

/// Capability-specific pacing algorithm shared by all swapchains of one device.
pub trait PacingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    fn core(&self) -> &PacingCore;

    fn refresh_cycle_duration(&self, swapchain: vk::SwapchainKHR) -> VkResult<u64>;

    /// Presents `info` on `queue`. Returns the native result code untouched.
    fn queue_present(
        &self,
        queue: vk::Queue,
        queue_family_index: u32,
        info: &PresentInfo<'_>,
    ) -> vk::Result;

    fn set_swap_interval_ns(&self, _swapchain: vk::SwapchainKHR, swap_interval_ns: u64) {
        self.core().state().set_swap_interval_ns(swap_interval_ns);
    }

    fn set_auto_swap_interval(&self, enabled: bool) {
        self.core().state().set_auto_swap_interval(enabled);
    }

    fn set_auto_pipeline_mode(&self, enabled: bool) {
        self.core().state().set_auto_pipeline_mode(enabled);
    }

    fn set_fence_timeout(&self, timeout: Duration) {
        self.core().state().fence_timeout = timeout;
    }

    fn fence_timeout(&self) -> Duration {
        self.core().state().fence_timeout
    }

    fn forget_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.core().timelines().forget(swapchain);
    }

    /// Lowest present id not yet handed out on this device.
    fn present_id_watermark(&self) -> u32 {
        self.core().timelines().watermark()
    }
}

/// Native code carried by a construction failure, for handing back to the application.
pub fn vk_code(report: &Report) -> vk::Result {
    report
        .downcast_ref::<vk::Result>()
        .copied()
        .unwrap_or(vk::Result::ERROR_INITIALIZATION_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::{WrapErr, eyre};

    #[test]
    fn vk_code_sees_through_context() {
        let wrapped: color_eyre::Result<()> = Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
            .wrap_err("Failed to create frame synchronization objects");
        let report = wrapped.expect_err("wrapped error");
        assert_eq!(vk_code(&report), vk::Result::ERROR_OUT_OF_HOST_MEMORY);

        assert_eq!(vk_code(&eyre!("no code")), vk::Result::ERROR_INITIALIZATION_FAILED);
    }
}
