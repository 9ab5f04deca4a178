/// Simulated device, display and clock.
/// Used by the unit tests and the headless demo; nothing here touches a real GPU.

mod device;
mod vsync;

pub use device::{RecordedPresent, RecordedSubmit, SimDevice, TimingModel};
pub use vsync::{ManualVsync, TickingVsync};

use std::ffi::{CStr, c_char};
use std::sync::atomic::{AtomicU64, Ordering};
use ash::vk;
use crate::internals::clock::Clock;

/// Extension record as a driver would report it for `name`.
pub fn extension_properties(name: &CStr) -> vk::ExtensionProperties {
    let mut properties = vk::ExtensionProperties::default();
    for (dst, src) in properties.extension_name.iter_mut().zip(name.to_bytes()) {
        *dst = *src as c_char;
    }
    properties
}

#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now_ns: u64) -> Self {
        Self(AtomicU64::new(now_ns))
    }

    pub fn set(&self, now_ns: u64) {
        self.0.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) {
        self.0.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
