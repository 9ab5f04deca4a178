use std::sync::Arc;
use std::time::Duration;
use ash::vk;
use ash::vk::Handle;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, WrapErr, eyre};
use vkpace::sim::{SimDevice, TickingVsync, TimingModel, extension_properties};
use vkpace::{Clock, DeviceRegistry, MonotonicClock, PacingConfig, PacingDevice, PresentInfo, VsyncSource};

const FRAMES: usize = 120;
const REFRESH_NS: u64 = 16_666_666;

// Paces a simulated 60 Hz display with uneven CPU work and reports the resulting cadence.
fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
    let vsync: Arc<dyn VsyncSource> = Arc::new(TickingVsync::new(Duration::from_nanos(REFRESH_NS), clock.clone())?);

    let device = Arc::new(SimDevice::new(1));
    device.set_timing_model(TimingModel::VsyncGrid { period_ns: REFRESH_NS });
    let pacing_device: Arc<dyn PacingDevice> = device.clone();

    let registry = DeviceRegistry::new(PacingConfig::default(), clock, Some(vsync));

    let available = [
        extension_properties(ash::khr::swapchain::NAME),
        extension_properties(ash::google::display_timing::NAME),
    ];
    let enabled = registry.probe_extensions(device.physical_device(), &available);
    log::info!("Enabling device extensions {enabled:?}");

    let queue = vk::Queue::from_raw(1);
    let swapchain = vk::SwapchainKHR::from_raw(1);
    registry.set_queue_family_index(device.handle(), queue, 0);

    let refresh_ns = registry
        .init_refresh_cycle_duration(&pacing_device, swapchain)
        .wrap_err("Failed to query the refresh cycle duration")?;
    registry.set_swap_interval_ns(device.handle(), swapchain, refresh_ns);

    let kind = registry
        .strategy_kind(device.handle())
        .ok_or_eyre("No pacing strategy was set up")?;
    log::info!("Pacing with {kind} at {refresh_ns} ns per refresh");

    let swapchains = [swapchain];
    for frame in 0..FRAMES {
        let work = Duration::from_millis(2 + (frame % 4) as u64 * 3);
        std::thread::sleep(work);

        let image_indices = [(frame % 3) as u32];
        let result = registry.queue_present(queue, &PresentInfo::new(&[], &swapchains, &image_indices));
        if result != vk::Result::SUCCESS {
            return Err(eyre!("Present {frame} failed: {result}"));
        }
    }

    let desired: Vec<u64> = device
        .presents()
        .iter()
        .filter_map(|present| present.times.as_ref())
        .map(|times| times[0].desired_present_time)
        .collect();
    let spacing: Vec<u64> = desired.windows(2).map(|w| w[1].saturating_sub(w[0])).collect();
    let on_cadence = spacing.iter().filter(|&&ns| ns.abs_diff(refresh_ns) < refresh_ns / 2).count();
    let mean = spacing.iter().sum::<u64>() / spacing.len().max(1) as u64;

    println!("{kind}: {} presents, mean spacing {:.3} ms, {on_cadence}/{} on one refresh",
        desired.len(),
        mean as f64 / 1_000_000.0,
        spacing.len(),
    );

    registry.destroy_swapchain(device.handle(), swapchain);
    Ok(())
}
