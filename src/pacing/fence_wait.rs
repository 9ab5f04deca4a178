use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Result;
use smallvec::SmallVec;
use crate::core::state::PipelineMode;
use crate::internals::sync_pool::{SyncLists, SyncPool};
use crate::internals::vsync::{VsyncBridge, VsyncChannel, VsyncSource, VsyncState};
use crate::pacing::auto_swap::{AutoSwapInterval, FrameDuration};
use crate::pacing::{PacingCore, PacingStrategy, StrategyKind, vk_code};
use crate::vk::PresentInfo;

#[derive(Default)]
struct Pools {
    by_queue: HashMap<vk::Queue, Arc<SyncPool>>,
    // Set once a pool could not be built; the device cannot pace from then on
    failure: Option<vk::Result>,
}

#[derive(Default)]
struct Schedule {
    next_desired_present_time: Option<u64>,
    last_present_end_ns: Option<u64>,
}

/// VK_GOOGLE_display_timing scheduling anchored to platform vsync callbacks.
///
/// Responsibilities:
/// - Hold each present until the vsync it is meant for
/// - Bound in-flight frames per queue with a `SyncPool`
/// - Gate the present on a no-op submit so its fence tracks frame completion
/// - Feed frame durations to the auto swap interval controller
pub struct FenceWait {
    core: PacingCore,
    depth: usize,
    pools: Mutex<Pools>,
    schedule: Mutex<Schedule>,
    auto_swap: Mutex<AutoSwapInterval>,
    bridge: VsyncBridge,
}

impl FenceWait {
    /// Pools for `queues` (queue, family) are created up front; other queues get theirs on first present.
    pub fn new(
        core: PacingCore,
        vsync: Arc<dyn VsyncSource>,
        depth: usize,
        max_auto_frame_budget_ns: u64,
        queues: &[(vk::Queue, u32)],
    ) -> Result<Self> {
        let mut by_queue = HashMap::new();
        for &(queue, queue_family_index) in queues {
            let pool = SyncPool::new(core.device().clone(), queue_family_index, depth)?;
            by_queue.insert(queue, Arc::new(pool));
        }

        let bridge = VsyncBridge::new(vsync, Arc::new(VsyncChannel::new()))?;

        Ok(Self {
            core,
            depth,
            pools: Mutex::new(Pools {
                by_queue,
                failure: None,
            }),
            schedule: Mutex::new(Schedule::default()),
            auto_swap: Mutex::new(AutoSwapInterval::new(max_auto_frame_budget_ns)),
            bridge,
        })
    }

    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auto_swap(&self) -> MutexGuard<'_, AutoSwapInterval> {
        self.auto_swap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self) -> &VsyncChannel {
        self.bridge.channel()
    }

    fn pool_for(&self, queue: vk::Queue, queue_family_index: u32) -> std::result::Result<Arc<SyncPool>, vk::Result> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(code) = pools.failure {
            return Err(code);
        }
        if let Some(pool) = pools.by_queue.get(&queue) {
            return Ok(pool.clone());
        }

        match SyncPool::new(self.core.device().clone(), queue_family_index, self.depth) {
            Ok(pool) => {
                let pool = Arc::new(pool);
                pools.by_queue.insert(queue, pool.clone());
                Ok(pool)
            }
            Err(report) => {
                let code = vk_code(&report);
                log::error!("Frame pacing disabled for this device: {report:?}");
                pools.failure = Some(code);
                Err(code)
            }
        }
    }

    fn wait_for_target_frame(&self, timeout: Duration) {
        let waited = self.channel().wait_until(
            timeout,
            |s| s.frame_id >= s.target_frame_id,
            || self.bridge.request(),
        );
        if waited.is_err() {
            log::warn!("No vsync within {timeout:?}, presenting without waiting for the target frame");
        }
    }

    /// Waits for the oldest in-flight frame and returns its slot to the free list.
    /// `Ok(false)` when the fence stayed unsignalled for the whole timeout, measured on the
    /// pacing clock. Without vsyncs the wait also ends after `timeout` of real time.
    fn reclaim_oldest(&self, lists: &mut SyncLists, timeout: Duration) -> VkResult<bool> {
        let Some(slot) = lists.oldest_pending() else {
            return Ok(true);
        };
        let device = self.core.device();
        let started = self.core.now_ns();
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let mut gave_up = false;
        let mut failure = None;

        let waited = self.channel().wait_until(
            timeout,
            |s| match device.wait_for_fence(slot.fence, 0) {
                Ok(()) => true,
                Err(vk::Result::TIMEOUT) => {
                    if self.core.now_ns().saturating_sub(started) >= timeout_ns {
                        gave_up = true;
                        return true;
                    }
                    // Each vsync spent waiting on the GPU pushes the schedule back a frame
                    s.target_frame_id += 1;
                    false
                }
                Err(e) => {
                    failure = Some(e);
                    true
                }
            },
            || self.bridge.request(),
        );

        if let Some(e) = failure {
            return Err(e);
        }
        if gave_up || waited.is_err() {
            return Ok(false);
        }

        device.reset_fence(slot.fence)?;
        lists.recycle_oldest();
        Ok(true)
    }

    /// Clamps a target the vsync count fell behind and returns the frames skipped past it.
    fn reconcile_target_frame(&self) -> VsyncState {
        self.channel().update(|s| {
            if s.frame_id < s.target_frame_id {
                log::error!(
                    "Vsync frame {} fell behind target frame {}",
                    s.frame_id,
                    s.target_frame_id
                );
                s.target_frame_id = s.frame_id;
            }
            *s
        })
    }
}

impl PacingStrategy for FenceWait {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FenceWait
    }

    fn core(&self) -> &PacingCore {
        &self.core
    }

    fn refresh_cycle_duration(&self, swapchain: vk::SwapchainKHR) -> VkResult<u64> {
        self.core.query_refresh_duration(swapchain)
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        queue_family_index: u32,
        info: &PresentInfo<'_>,
    ) -> vk::Result {
        let pool = match self.pool_for(queue, queue_family_index) {
            Ok(pool) => pool,
            Err(code) => return code,
        };
        // Serializes presents on this queue
        let mut lists = pool.lock();
        let device = self.core.device();

        let present_start = self.core.now_ns();
        let fence_timeout = self.core.state().fence_timeout;
        let cpu_ns = self.schedule()
            .last_present_end_ns
            .map(|end| present_start.saturating_sub(end));

        self.wait_for_target_frame(fence_timeout);

        let mut gpu_wait_ns = 0;
        let mut sync_ready = true;
        if lists.is_exhausted() {
            let wait_start = self.core.now_ns();
            match self.reclaim_oldest(&mut lists, fence_timeout) {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("Previous frame still in flight after {fence_timeout:?}, presenting without frame sync");
                    sync_ready = false;
                }
                Err(e) => {
                    log::error!("Waiting for previous frame failed: {e}");
                    return e;
                }
            }
            gpu_wait_ns = self.core.now_ns().saturating_sub(wait_start);
        }

        let (refresh_duration_ns, frame_budget_ns, swap_interval, pipeline_mode) = {
            let state = self.core.state();
            (state.refresh_duration_ns, state.frame_budget_ns(), state.swap_interval, state.pipeline_mode)
        };

        let vsync = self.reconcile_target_frame();
        let mut schedule = self.schedule();
        let now = self.core.now_ns();
        let desired = match schedule.next_desired_present_time {
            None => now + refresh_duration_ns,
            Some(desired) => desired + (vsync.frame_id - vsync.target_frame_id) * refresh_duration_ns,
        };

        let signal_semaphore: [vk::Semaphore; 1];
        let slot = if sync_ready { lists.acquire() } else { None };
        let present_info = match slot {
            Some(slot) => {
                if let Err(e) = device.submit_sync(queue, info.wait_semaphores, &slot) {
                    lists.release_unsubmitted(slot);
                    log::error!("Failed to submit frame synchronization: {e}");
                    return e;
                }
                signal_semaphore = [slot.semaphore];
                info.with_wait_semaphores(&signal_semaphore)
            }
            None => *info,
        };

        let times: SmallVec<[vk::PresentTimeGOOGLE; 4]> = {
            let mut timelines = self.core.timelines();
            info.swapchains
                .iter()
                .map(|&swapchain| timelines.issue(swapchain, desired))
                .collect()
        };
        log::trace!("Presenting {times:?} at vsync frame {}", vsync.frame_id);
        let result = device.queue_present(queue, &present_info, Some(&times));

        let intervals_ahead = match pipeline_mode {
            PipelineMode::On => 2,
            PipelineMode::Off => 1,
        };
        let latest = self.channel().update(|s| {
            s.target_frame_id = s.frame_id + u64::from(swap_interval);
            *s
        });
        // Before the first vsync there is nothing to anchor to
        let anchor = if latest.frame_id == 0 { now } else { latest.last_frame_time_ns };
        schedule.next_desired_present_time = Some(anchor + intervals_ahead * frame_budget_ns);
        schedule.last_present_end_ns = Some(self.core.now_ns());
        drop(schedule);

        self.bridge.request();

        if let Some(cpu_ns) = cpu_ns {
            let mut auto_swap = self.auto_swap();
            let mut state = self.core.state();
            auto_swap.record(FrameDuration::new(cpu_ns, gpu_wait_ns), &mut state);
        }

        result
    }

    fn set_auto_swap_interval(&self, enabled: bool) {
        let mut auto_swap = self.auto_swap();
        self.core.state().set_auto_swap_interval(enabled);
        auto_swap.clear();
    }
}
