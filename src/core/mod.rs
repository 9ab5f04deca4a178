/// "Core" refers to the per-process bookkeeping every strategy depends on:
/// configuration, per-device pacing state, extension probing and the device registry.

pub mod config;
pub mod extensions;
pub mod registry;
pub mod state;
