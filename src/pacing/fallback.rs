use ash::prelude::VkResult;
use ash::vk;
use crate::pacing::{PacingCore, PacingStrategy, StrategyKind};
use crate::vk::PresentInfo;

/// Used when the device has no way to schedule presents.
/// Reports the configured fallback refresh period and passes presents straight through.
pub struct Fallback {
    core: PacingCore,
}

impl Fallback {
    pub fn new(core: PacingCore) -> Self {
        Self { core }
    }
}

impl PacingStrategy for Fallback {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fallback
    }

    fn core(&self) -> &PacingCore {
        &self.core
    }

    fn refresh_cycle_duration(&self, _swapchain: vk::SwapchainKHR) -> VkResult<u64> {
        Ok(self.core.state().refresh_duration_ns)
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        _queue_family_index: u32,
        info: &PresentInfo<'_>,
    ) -> vk::Result {
        self.core.device().queue_present(queue, info, None)
    }
}
