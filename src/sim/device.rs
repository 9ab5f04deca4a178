use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use crate::vk::{PacingDevice, PresentInfo, SyncSlot};

/// How the simulated display turns a requested present time into an actual one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimingModel {
    /// Records are only produced through `SimDevice::push_past_timing`.
    #[default]
    Manual,
    /// Every frame lands this many nanoseconds after its desired time.
    Offset(i64),
    /// Every frame lands on the first vsync at or after its desired time.
    VsyncGrid { period_ns: u64 },
}

#[derive(Clone, Debug)]
pub struct RecordedPresent {
    pub queue: vk::Queue,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub swapchains: Vec<vk::SwapchainKHR>,
    pub image_indices: Vec<u32>,
    pub times: Option<Vec<vk::PresentTimeGOOGLE>>,
}

#[derive(Clone, Debug)]
pub struct RecordedSubmit {
    pub queue: vk::Queue,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub slot: SyncSlot,
}

struct SimState {
    display_timing: bool,
    refresh: VkResult<u64>,
    timing_model: TimingModel,
    past_timing: HashMap<vk::SwapchainKHR, Vec<vk::PastPresentationTimingGOOGLE>>,
    past_timing_error: Option<vk::Result>,
    gpu_instant: bool,
    sync_creation_error: Option<vk::Result>,
    present_result: vk::Result,
    fences: HashMap<vk::Fence, bool>,
    live: HashSet<u64>,
    presents: Vec<RecordedPresent>,
    submits: Vec<RecordedSubmit>,
    calls: usize,
}

/// In-process stand-in for a Vulkan device with a display attached.
///
/// Fences are plain flags: with `gpu_instant` set, submitted work completes immediately,
/// otherwise fences stay unsignalled until `signal_fence` is called.
pub struct SimDevice {
    handle: vk::Device,
    physical: vk::PhysicalDevice,
    next_handle: AtomicU64,
    state: Mutex<SimState>,
    fence_signalled: Condvar,
}

impl SimDevice {
    pub fn new(id: u64) -> Self {
        Self {
            handle: vk::Device::from_raw(id),
            physical: vk::PhysicalDevice::from_raw(id),
            next_handle: AtomicU64::new((id << 32) | 1),
            state: Mutex::new(SimState {
                display_timing: true,
                refresh: Ok(16_666_666),
                timing_model: TimingModel::Manual,
                past_timing: HashMap::new(),
                past_timing_error: None,
                gpu_instant: true,
                sync_creation_error: None,
                present_result: vk::Result::SUCCESS,
                fences: HashMap::new(),
                live: HashSet::new(),
                presents: Vec::new(),
                submits: Vec::new(),
                calls: 0,
            }),
            fence_signalled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Disables the VK_GOOGLE_display_timing entry points.
    pub fn without_display_timing(self) -> Self {
        self.lock().display_timing = false;
        self
    }

    pub fn set_refresh_result(&self, refresh: VkResult<u64>) {
        self.lock().refresh = refresh;
    }

    pub fn set_timing_model(&self, model: TimingModel) {
        self.lock().timing_model = model;
    }

    pub fn set_gpu_instant(&self, instant: bool) {
        self.lock().gpu_instant = instant;
    }

    pub fn set_present_result(&self, result: vk::Result) {
        self.lock().present_result = result;
    }

    pub fn fail_past_timing(&self, error: Option<vk::Result>) {
        self.lock().past_timing_error = error;
    }

    pub fn fail_sync_creation(&self, error: Option<vk::Result>) {
        self.lock().sync_creation_error = error;
    }

    /// Queues a completed-frame record for the next past-timing query on `swapchain`.
    pub fn push_past_timing(
        &self,
        swapchain: vk::SwapchainKHR,
        present_id: u32,
        desired_present_time: u64,
        actual_present_time: u64,
    ) {
        self.lock()
            .past_timing
            .entry(swapchain)
            .or_default()
            .push(vk::PastPresentationTimingGOOGLE {
                present_id,
                desired_present_time,
                actual_present_time,
                earliest_present_time: actual_present_time,
                present_margin: 0,
            });
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        if let Some(signalled) = self.lock().fences.get_mut(&fence) {
            *signalled = true;
        }
        self.fence_signalled.notify_all();
    }

    pub fn is_signalled(&self, fence: vk::Fence) -> bool {
        self.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn presents(&self) -> Vec<RecordedPresent> {
        self.lock().presents.clone()
    }

    pub fn submits(&self) -> Vec<RecordedSubmit> {
        self.lock().submits.clone()
    }

    /// Number of device entry points invoked so far.
    pub fn platform_calls(&self) -> usize {
        self.lock().calls
    }

    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.lock().live.len()
    }
}

impl PacingDevice for SimDevice {
    fn handle(&self) -> vk::Device {
        self.handle
    }

    fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical
    }

    fn refresh_cycle_duration(&self, _swapchain: vk::SwapchainKHR) -> VkResult<u64> {
        let mut state = self.lock();
        state.calls += 1;
        if !state.display_timing {
            return Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        }
        state.refresh
    }

    fn past_presentation_timing(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> VkResult<Vec<vk::PastPresentationTimingGOOGLE>> {
        let mut state = self.lock();
        state.calls += 1;
        if !state.display_timing {
            return Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        }
        if let Some(e) = state.past_timing_error {
            return Err(e);
        }
        Ok(state.past_timing.remove(&swapchain).unwrap_or_default())
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        info: &PresentInfo<'_>,
        times: Option<&[vk::PresentTimeGOOGLE]>,
    ) -> vk::Result {
        let mut state = self.lock();
        state.calls += 1;

        if let Some(times) = times {
            for (swapchain, time) in info.swapchains.iter().zip(times) {
                let actual = match state.timing_model {
                    TimingModel::Manual => continue,
                    TimingModel::Offset(offset) => time.desired_present_time.saturating_add_signed(offset),
                    TimingModel::VsyncGrid { period_ns } => {
                        time.desired_present_time.div_ceil(period_ns.max(1)) * period_ns.max(1)
                    }
                };
                state.past_timing.entry(*swapchain).or_default().push(vk::PastPresentationTimingGOOGLE {
                    present_id: time.present_id,
                    desired_present_time: time.desired_present_time,
                    actual_present_time: actual,
                    earliest_present_time: actual,
                    present_margin: 0,
                });
            }
        }

        state.presents.push(RecordedPresent {
            queue,
            wait_semaphores: info.wait_semaphores.to_vec(),
            swapchains: info.swapchains.to_vec(),
            image_indices: info.image_indices.to_vec(),
            times: times.map(<[_]>::to_vec),
        });
        state.present_result
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let raw = self.next_raw();
        let mut state = self.lock();
        state.calls += 1;
        state.live.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        state.calls += 1;
        state.live.remove(&pool.as_raw());
    }

    fn create_sync_slot(&self, _pool: vk::CommandPool) -> VkResult<SyncSlot> {
        let slot = SyncSlot {
            fence: vk::Fence::from_raw(self.next_raw()),
            semaphore: vk::Semaphore::from_raw(self.next_raw()),
            command_buffer: vk::CommandBuffer::from_raw(self.next_raw()),
            event: vk::Event::from_raw(self.next_raw()),
        };

        let mut state = self.lock();
        state.calls += 1;
        if let Some(e) = state.sync_creation_error {
            return Err(e);
        }
        state.fences.insert(slot.fence, false);
        state.live.extend([
            slot.fence.as_raw(),
            slot.semaphore.as_raw(),
            slot.command_buffer.as_raw(),
            slot.event.as_raw(),
        ]);
        Ok(slot)
    }

    fn destroy_sync_slot(&self, _pool: vk::CommandPool, slot: &SyncSlot) {
        let mut state = self.lock();
        state.calls += 1;
        state.fences.remove(&slot.fence);
        for raw in [
            slot.fence.as_raw(),
            slot.semaphore.as_raw(),
            slot.command_buffer.as_raw(),
            slot.event.as_raw(),
        ] {
            state.live.remove(&raw);
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let mut state = self.lock();
        state.calls += 1;
        if !state.fences.contains_key(&fence) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        let (state, _) = self.fence_signalled
            .wait_timeout_while(state, Duration::from_nanos(timeout_ns), |s| {
                !s.fences.get(&fence).copied().unwrap_or(true)
            })
            .unwrap_or_else(PoisonError::into_inner);

        match state.fences.get(&fence) {
            Some(true) | None => Ok(()),
            Some(false) => Err(vk::Result::TIMEOUT),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.lock();
        state.calls += 1;
        match state.fences.get_mut(&fence) {
            Some(signalled) => {
                *signalled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_DEVICE_LOST),
        }
    }

    fn submit_sync(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        slot: &SyncSlot,
    ) -> VkResult<()> {
        let mut state = self.lock();
        state.calls += 1;
        let gpu_instant = state.gpu_instant;
        match state.fences.get_mut(&slot.fence) {
            // Submitting with a signalled fence is invalid usage
            Some(true) | None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
            Some(signalled) => *signalled = gpu_instant,
        }
        state.submits.push(RecordedSubmit {
            queue,
            wait_semaphores: wait_semaphores.to_vec(),
            slot: *slot,
        });
        drop(state);

        self.fence_signalled.notify_all();
        Ok(())
    }
}
