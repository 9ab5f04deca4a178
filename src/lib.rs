//! Frame pacing for Vulkan swapchains.
//!
//! A `DeviceRegistry` sits between the application and `vkQueuePresentKHR`. It picks a pacing
//! strategy per logical device, from what the driver and platform offer, and schedules every
//! present so frames reach the display at an even cadence.

pub mod core;
pub mod internals;
pub mod pacing;
pub mod sim;
pub mod vk;

pub use crate::core::config::PacingConfig;
pub use crate::core::registry::DeviceRegistry;
pub use crate::internals::clock::{Clock, MonotonicClock};
pub use crate::internals::vsync::{FrameCallback, VsyncSource};
pub use crate::pacing::StrategyKind;
pub use crate::vk::ash_device::AshDevice;
pub use crate::vk::{PacingDevice, PresentInfo};
