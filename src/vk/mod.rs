/// "Vk" holds the thin seam between pacing logic and the native Vulkan device.
/// Everything above this module talks to a `PacingDevice` instead of `ash::Device` directly,
/// so strategies can run against the simulated device in tests.

pub mod ash_device;

use ash::prelude::VkResult;
use ash::vk;

/// One reusable tuple of synchronization objects used to gate a single presented frame.
/// The command buffer is pre-recorded to set `event` and is resubmitted unchanged every time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncSlot {
    pub fence: vk::Fence,
    pub semaphore: vk::Semaphore,
    pub command_buffer: vk::CommandBuffer,
    pub event: vk::Event,
}

/// Borrowed view of a `vkQueuePresentKHR` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct PresentInfo<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub swapchains: &'a [vk::SwapchainKHR],
    pub image_indices: &'a [u32],
}

impl<'a> PresentInfo<'a> {
    pub fn new(
        wait_semaphores: &'a [vk::Semaphore],
        swapchains: &'a [vk::SwapchainKHR],
        image_indices: &'a [u32],
    ) -> Self {
        Self {
            wait_semaphores,
            swapchains,
            image_indices,
        }
    }

    /// Views the arrays of a raw `vk::PresentInfoKHR`.
    ///
    /// # Safety
    /// The pointers in `info` must be valid for their counts for as long as `'a`.
    pub unsafe fn from_raw(info: &'a vk::PresentInfoKHR<'_>) -> Self {
        unsafe {
            Self {
                wait_semaphores: raw_slice(info.p_wait_semaphores, info.wait_semaphore_count),
                swapchains: raw_slice(info.p_swapchains, info.swapchain_count),
                image_indices: raw_slice(info.p_image_indices, info.swapchain_count),
            }
        }
    }

    /// Same present, gated on a different set of semaphores.
    pub fn with_wait_semaphores(self, wait_semaphores: &'a [vk::Semaphore]) -> Self {
        Self {
            wait_semaphores,
            ..self
        }
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, count as usize) }
    }
}

/// Native operations the pacing strategies need from a logical device.
///
/// Results follow `ash` conventions: `VkResult` for calls with a payload or an error path,
/// a bare `vk::Result` for present, whose code (including `SUBOPTIMAL_KHR`) is handed back to
/// the application untouched.
pub trait PacingDevice: Send + Sync {
    fn handle(&self) -> vk::Device;
    fn physical_device(&self) -> vk::PhysicalDevice;

    /// `vkGetRefreshCycleDurationGOOGLE`, in nanoseconds.
    fn refresh_cycle_duration(&self, swapchain: vk::SwapchainKHR) -> VkResult<u64>;

    /// `vkGetPastPresentationTimingGOOGLE`: records completed since the previous query.
    fn past_presentation_timing(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> VkResult<Vec<vk::PastPresentationTimingGOOGLE>>;

    /// `vkQueuePresentKHR`, with a `VkPresentTimesInfoGOOGLE` chained when `times` is given.
    fn queue_present(
        &self,
        queue: vk::Queue,
        info: &PresentInfo<'_>,
        times: Option<&[vk::PresentTimeGOOGLE]>,
    ) -> vk::Result;

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Creates an unsignalled fence, a binary semaphore, an event and a command buffer from `pool`
    /// recorded to set that event.
    fn create_sync_slot(&self, pool: vk::CommandPool) -> VkResult<SyncSlot>;
    fn destroy_sync_slot(&self, pool: vk::CommandPool, slot: &SyncSlot);

    /// Blocks for at most `timeout_ns`. `Err(vk::Result::TIMEOUT)` when the fence is still unsignalled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// Submits the slot's command buffer waiting on `wait_semaphores` at colour-attachment output,
    /// signalling the slot's semaphore and fence.
    fn submit_sync(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        slot: &SyncSlot,
    ) -> VkResult<()>;
}

/// Folds `VkResult<bool>` from `ash`'s present into the raw code the application expects.
pub fn present_result(result: VkResult<bool>) -> vk::Result {
    match result {
        Ok(false) => vk::Result::SUCCESS,
        Ok(true) => vk::Result::SUBOPTIMAL_KHR,
        Err(e) => e,
    }
}
