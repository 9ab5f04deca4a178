use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Result;
use crate::core::config::PacingConfig;
use crate::core::extensions::supported_pacing_extensions;
use crate::core::state::PacingState;
use crate::internals::clock::Clock;
use crate::internals::vsync::VsyncSource;
use crate::pacing::display_timing::DisplayTiming;
use crate::pacing::fallback::Fallback;
use crate::pacing::fence_wait::FenceWait;
use crate::pacing::{PacingCore, PacingStrategy, StrategyKind, vk_code};
use crate::vk::{PacingDevice, PresentInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct QueueBinding {
    device: vk::Device,
    queue_family_index: u32,
}

enum DeviceEntry {
    Ready(Arc<dyn PacingStrategy>),
    // Strategy construction failed; every call for the device keeps failing with this code
    Failed(vk::Result),
}

struct SwapchainBinding {
    device: vk::Device,
    strategy: Arc<dyn PacingStrategy>,
}

/// Settings applied to strategies built later as well as the live ones.
#[derive(Clone, Copy, Debug)]
struct Broadcast {
    fence_timeout: Duration,
    auto_swap_interval: bool,
    auto_pipeline_mode: bool,
}

struct RegistryInner {
    capabilities: HashMap<vk::PhysicalDevice, bool>,
    queues: HashMap<vk::Queue, QueueBinding>,
    devices: HashMap<vk::Device, DeviceEntry>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainBinding>,
    // Next free present id of devices whose strategy was released
    retired_watermarks: HashMap<vk::Device, u32>,
    broadcast: Broadcast,
}

impl RegistryInner {
    fn live_strategies(&self) -> Vec<Arc<dyn PacingStrategy>> {
        self.devices
            .values()
            .filter_map(|entry| match entry {
                DeviceEntry::Ready(strategy) => Some(strategy.clone()),
                DeviceEntry::Failed(_) => None,
            })
            .collect()
    }

    /// Unbinds everything belonging to `device`. The returned entry must be dropped
    /// after the registry lock is released.
    fn release_device(&mut self, device: vk::Device) -> Option<DeviceEntry> {
        self.queues.retain(|_, binding| binding.device != device);
        self.swapchains.retain(|_, binding| binding.device != device);

        let entry = self.devices.remove(&device)?;
        if let DeviceEntry::Ready(strategy) = &entry {
            let watermark = self.retired_watermarks.entry(device).or_insert(0);
            *watermark = (*watermark).max(strategy.present_id_watermark());
        }
        log::trace!("Released pacing state for device {device:?}");
        Some(entry)
    }
}

/// Routes every frame pacing call to the strategy chosen for its device.
///
/// Responsibilities:
/// - Record which physical devices support VK_GOOGLE_display_timing
/// - Bind queues and swapchains to their logical device
/// - Pick and own one `PacingStrategy` per logical device
///
/// One lock guards all maps. It is never held while a strategy presents or queries the device.
pub struct DeviceRegistry {
    config: PacingConfig,
    clock: Arc<dyn Clock>,
    vsync: Option<Arc<dyn VsyncSource>>,
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    /// `vsync` is the platform's per-refresh callback facility, if it has one.
    pub fn new(
        config: PacingConfig,
        clock: Arc<dyn Clock>,
        vsync: Option<Arc<dyn VsyncSource>>,
    ) -> Self {
        let broadcast = Broadcast {
            fence_timeout: config.fence_timeout,
            auto_swap_interval: config.auto_swap_interval,
            auto_pipeline_mode: config.auto_pipeline_mode,
        };

        Self {
            config,
            clock,
            vsync,
            inner: Mutex::new(RegistryInner {
                capabilities: HashMap::new(),
                queues: HashMap::new(),
                devices: HashMap::new(),
                swapchains: HashMap::new(),
                retired_watermarks: HashMap::new(),
                broadcast,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Two-call query of the device extensions pacing wants enabled.
    ///
    /// With `names` unset, stores the number of wanted extensions in `count`. With `names` set,
    /// writes at most `count` of them, updates `count` to the number written and records whether
    /// `physical_device` can use display timing.
    pub fn determine_device_extensions(
        &self,
        physical_device: vk::PhysicalDevice,
        available: &[vk::ExtensionProperties],
        count: &mut u32,
        names: Option<&mut [&'static CStr]>,
    ) {
        let supported = supported_pacing_extensions(available);
        let Some(names) = names else {
            *count = u32::try_from(supported.len()).unwrap_or(u32::MAX);
            return;
        };

        let written = (*count as usize).min(names.len()).min(supported.len());
        names[..written].copy_from_slice(&supported[..written]);
        *count = u32::try_from(written).unwrap_or(u32::MAX);

        let display_timing = names[..written].contains(&ash::google::display_timing::NAME);
        let previous = self.lock().capabilities.insert(physical_device, display_timing);
        if previous != Some(display_timing) {
            log::info!(
                "VK_GOOGLE_display_timing {} on {physical_device:?}",
                if display_timing { "available" } else { "not available" }
            );
        }
    }

    /// Both calls of `determine_device_extensions`. Returns the names to enable.
    pub fn probe_extensions(
        &self,
        physical_device: vk::PhysicalDevice,
        available: &[vk::ExtensionProperties],
    ) -> Vec<&'static CStr> {
        let mut count = 0;
        self.determine_device_extensions(physical_device, available, &mut count, None);

        let mut names = vec![c""; count as usize];
        self.determine_device_extensions(physical_device, available, &mut count, Some(names.as_mut_slice()));
        names.truncate(count as usize);
        names
    }

    /// Records which device and family `queue` belongs to. Required before presenting on it.
    pub fn set_queue_family_index(&self, device: vk::Device, queue: vk::Queue, queue_family_index: u32) {
        self.lock().queues.insert(queue, QueueBinding {
            device,
            queue_family_index,
        });
    }

    fn build_strategy(&self, device: &Arc<dyn PacingDevice>) -> Result<Arc<dyn PacingStrategy>> {
        let handle = device.handle();
        let (display_timing, watermark, queues, broadcast) = {
            let inner = self.lock();
            let queues: Vec<(vk::Queue, u32)> = inner.queues
                .iter()
                .filter(|(_, binding)| binding.device == handle)
                .map(|(queue, binding)| (*queue, binding.queue_family_index))
                .collect();
            (
                inner.capabilities.get(&device.physical_device()).copied().unwrap_or(false),
                inner.retired_watermarks.get(&handle).copied().unwrap_or(0),
                queues,
                inner.broadcast,
            )
        };

        let mut state = PacingState::new(&self.config);
        state.fence_timeout = broadcast.fence_timeout;
        state.set_auto_swap_interval(broadcast.auto_swap_interval);
        state.set_auto_pipeline_mode(broadcast.auto_pipeline_mode);
        let core = PacingCore::new(device.clone(), self.clock.clone(), state, watermark);

        let strategy: Arc<dyn PacingStrategy> = match (display_timing, &self.vsync) {
            (true, Some(vsync)) => {
                let max_auto_frame_budget_ns = u64::try_from(self.config.max_auto_swap_interval.as_nanos())
                    .unwrap_or(u64::MAX);
                Arc::new(FenceWait::new(
                    core,
                    vsync.clone(),
                    self.config.sync_pool_depth,
                    max_auto_frame_budget_ns,
                    &queues,
                )?)
            }
            (true, None) => Arc::new(DisplayTiming::new(core)),
            (false, _) => Arc::new(Fallback::new(core)),
        };

        log::info!("Pacing device {handle:?} with {} strategy", strategy.kind());
        Ok(strategy)
    }

    fn strategy_for_device(&self, device: &Arc<dyn PacingDevice>) -> VkResult<Arc<dyn PacingStrategy>> {
        let handle = device.handle();
        match self.lock().devices.get(&handle) {
            Some(DeviceEntry::Ready(strategy)) => return Ok(strategy.clone()),
            Some(DeviceEntry::Failed(code)) => return Err(*code),
            None => {}
        }

        let built = self.build_strategy(device);

        let mut inner = self.lock();
        // Another thread may have finished first; keep theirs
        if let Some(entry) = inner.devices.get(&handle) {
            return match entry {
                DeviceEntry::Ready(strategy) => Ok(strategy.clone()),
                DeviceEntry::Failed(code) => Err(*code),
            };
        }
        match built {
            Ok(strategy) => {
                inner.devices.insert(handle, DeviceEntry::Ready(strategy.clone()));
                Ok(strategy)
            }
            Err(report) => {
                let code = vk_code(&report);
                log::error!("Failed to set up frame pacing for device {handle:?}: {report:?}");
                inner.devices.insert(handle, DeviceEntry::Failed(code));
                Err(code)
            }
        }
    }

    /// Sets up pacing for `device` on first use, binds `swapchain` to it and returns the
    /// display refresh period in nanoseconds.
    pub fn init_refresh_cycle_duration(
        &self,
        device: &Arc<dyn PacingDevice>,
        swapchain: vk::SwapchainKHR,
    ) -> VkResult<u64> {
        let strategy = self.strategy_for_device(device)?;
        let refresh_duration_ns = strategy.refresh_cycle_duration(swapchain)?;

        self.lock().swapchains.insert(swapchain, SwapchainBinding {
            device: device.handle(),
            strategy,
        });
        Ok(refresh_duration_ns)
    }

    /// Requested time between frames. Ignored for swapchains not yet initialized.
    pub fn set_swap_interval_ns(&self, device: vk::Device, swapchain: vk::SwapchainKHR, swap_interval_ns: u64) {
        let strategy = match self.lock().swapchains.get(&swapchain) {
            Some(binding) if binding.device == device => binding.strategy.clone(),
            _ => return,
        };
        strategy.set_swap_interval_ns(swapchain, swap_interval_ns);
    }

    /// Paced replacement for `vkQueuePresentKHR`.
    pub fn queue_present(&self, queue: vk::Queue, info: &PresentInfo<'_>) -> vk::Result {
        let (strategy, queue_family_index) = {
            let inner = self.lock();
            let Some(queue_binding) = inner.queues.get(&queue) else {
                log::error!("Present on queue {queue:?} before its queue family was set");
                return vk::Result::ERROR_DEVICE_LOST;
            };
            let Some(swapchain) = info.swapchains.first() else {
                log::error!("Present without swapchains on queue {queue:?}");
                return vk::Result::ERROR_DEVICE_LOST;
            };
            let Some(binding) = inner.swapchains.get(swapchain) else {
                log::error!("Present on swapchain {swapchain:?} before its refresh duration was queried");
                return vk::Result::ERROR_DEVICE_LOST;
            };
            (binding.strategy.clone(), queue_binding.queue_family_index)
        };

        strategy.queue_present(queue, queue_family_index, info)
    }

    /// Forgets `swapchain`. Pacing state for its device goes away with the last swapchain.
    pub fn destroy_swapchain(&self, device: vk::Device, swapchain: vk::SwapchainKHR) {
        let released = {
            let mut inner = self.lock();
            let Some(binding) = inner.swapchains.remove(&swapchain) else {
                return;
            };
            if binding.device != device {
                log::warn!("Swapchain {swapchain:?} belongs to {:?}, not {device:?}", binding.device);
            }
            binding.strategy.forget_swapchain(swapchain);

            let in_use = inner.swapchains.values().any(|b| b.device == binding.device);
            if in_use {
                None
            } else {
                inner.release_device(binding.device)
            }
        };
        drop(released);
    }

    /// Forgets everything bound to `device`, whether or not swapchains remain.
    pub fn destroy_device(&self, device: vk::Device) {
        let released = self.lock().release_device(device);
        drop(released);
    }

    pub fn set_auto_swap_interval(&self, enabled: bool) {
        let strategies = {
            let mut inner = self.lock();
            inner.broadcast.auto_swap_interval = enabled;
            inner.live_strategies()
        };
        for strategy in strategies {
            strategy.set_auto_swap_interval(enabled);
        }
    }

    pub fn set_auto_pipeline_mode(&self, enabled: bool) {
        let strategies = {
            let mut inner = self.lock();
            inner.broadcast.auto_pipeline_mode = enabled;
            inner.live_strategies()
        };
        for strategy in strategies {
            strategy.set_auto_pipeline_mode(enabled);
        }
    }

    pub fn set_fence_timeout_ns(&self, timeout_ns: u64) {
        let timeout = Duration::from_nanos(timeout_ns);
        let strategies = {
            let mut inner = self.lock();
            inner.broadcast.fence_timeout = timeout;
            inner.live_strategies()
        };
        for strategy in strategies {
            strategy.set_fence_timeout(timeout);
        }
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.lock().broadcast.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Which strategy paces `device`, if one was set up.
    pub fn strategy_kind(&self, device: vk::Device) -> Option<StrategyKind> {
        self.strategy(device).map(|strategy| strategy.kind())
    }

    /// Whether extension probing found display timing on `physical_device`.
    pub fn supports_display_timing(&self, physical_device: vk::PhysicalDevice) -> Option<bool> {
        self.lock().capabilities.get(&physical_device).copied()
    }

    pub(crate) fn strategy(&self, device: vk::Device) -> Option<Arc<dyn PacingStrategy>> {
        match self.lock().devices.get(&device) {
            Some(DeviceEntry::Ready(strategy)) => Some(strategy.clone()),
            _ => None,
        }
    }
}
