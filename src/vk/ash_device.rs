use ash::prelude::VkResult;
use ash::vk;
use smallvec::SmallVec;
use crate::vk::{PacingDevice, PresentInfo, SyncSlot, present_result};

/// `PacingDevice` backed by a real Vulkan device.
///
/// The wrapped `ash::Device` stays owned by the application; dropping this
/// does not destroy it.
pub struct AshDevice {
    device: ash::Device,
    physical: vk::PhysicalDevice,
    swapchain_loader: ash::khr::swapchain::Device,
    // Only loaded when the application enabled VK_GOOGLE_display_timing on the device
    display_timing: Option<ash::google::display_timing::Device>,
}

impl AshDevice {
    pub fn new(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
        device: ash::Device,
        display_timing_enabled: bool,
    ) -> Self {
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);
        let display_timing = display_timing_enabled
            .then(|| ash::google::display_timing::Device::new(instance, &device));

        Self {
            device,
            physical,
            swapchain_loader,
            display_timing,
        }
    }

    fn display_timing(&self) -> VkResult<&ash::google::display_timing::Device> {
        self.display_timing
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    fn create_slot_objects(
        &self,
        slot: &mut SyncSlot,
        command_buffer_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<()> {
        unsafe {
            slot.fence = self.device.create_fence(&vk::FenceCreateInfo::default(), None)?;
            slot.semaphore = self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
            slot.event = self.device.create_event(&vk::EventCreateInfo::default(), None)?;
            slot.command_buffer = self.device
                .allocate_command_buffers(command_buffer_info)?
                .first()
                .copied()
                .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        }
        Ok(())
    }

    fn record_set_event(&self, cmd: vk::CommandBuffer, event: vk::Event) -> VkResult<()> {
        // Resubmitted every frame without re-recording
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
        unsafe {
            self.device.begin_command_buffer(cmd, &begin_info)?;
            self.device.cmd_set_event(cmd, event, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
            self.device.end_command_buffer(cmd)
        }
    }
}

impl PacingDevice for AshDevice {
    fn handle(&self) -> vk::Device {
        self.device.handle()
    }

    fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical
    }

    fn refresh_cycle_duration(&self, swapchain: vk::SwapchainKHR) -> VkResult<u64> {
        let timing = self.display_timing()?;
        let duration = unsafe { timing.get_refresh_cycle_duration(swapchain)? };
        Ok(duration.refresh_duration)
    }

    fn past_presentation_timing(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> VkResult<Vec<vk::PastPresentationTimingGOOGLE>> {
        let timing = self.display_timing()?;
        unsafe { timing.get_past_presentation_timing(swapchain) }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        info: &PresentInfo<'_>,
        times: Option<&[vk::PresentTimeGOOGLE]>,
    ) -> vk::Result {
        let mut times_info = times.map(|times| vk::PresentTimesInfoGOOGLE::default().times(times));

        let mut present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(info.wait_semaphores)
            .swapchains(info.swapchains)
            .image_indices(info.image_indices);
        if let Some(times_info) = times_info.as_mut() {
            present_info = present_info.push_next(times_info);
        }

        present_result(unsafe { self.swapchain_loader.queue_present(queue, &present_info) })
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index);
        unsafe { self.device.create_command_pool(&pool_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.device.destroy_command_pool(pool, None);
        }
    }

    fn create_sync_slot(&self, pool: vk::CommandPool) -> VkResult<SyncSlot> {
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);

        let mut slot = SyncSlot {
            fence: vk::Fence::null(),
            semaphore: vk::Semaphore::null(),
            command_buffer: vk::CommandBuffer::null(),
            event: vk::Event::null(),
        };

        let created = self.create_slot_objects(&mut slot, &command_buffer_info);

        match created.and_then(|()| self.record_set_event(slot.command_buffer, slot.event)) {
            Ok(()) => Ok(slot),
            Err(e) => {
                // Null handles are ignored by the destroy calls
                self.destroy_sync_slot(pool, &slot);
                Err(e)
            }
        }
    }

    fn destroy_sync_slot(&self, pool: vk::CommandPool, slot: &SyncSlot) {
        unsafe {
            if slot.command_buffer != vk::CommandBuffer::null() {
                self.device.free_command_buffers(pool, &[slot.command_buffer]);
            }
            self.device.destroy_event(slot.event, None);
            self.device.destroy_semaphore(slot.semaphore, None);
            self.device.destroy_fence(slot.fence, None);
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn submit_sync(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        slot: &SyncSlot,
    ) -> VkResult<()> {
        let wait_stages: SmallVec<[vk::PipelineStageFlags; 4]> = wait_semaphores
            .iter()
            .map(|_| vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .collect();
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [slot.semaphore];

        let submit = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device.queue_submit(queue, &[submit], slot.fence)
        }
    }
}
