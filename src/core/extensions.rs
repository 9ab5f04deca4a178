use std::ffi::CStr;
use ash::vk;

/// Device extensions frame pacing can make use of.
pub fn pacing_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::google::display_timing::NAME,
    ]
}

/// Names from `pacing_device_extensions` the device reports as available, in that order.
pub fn supported_pacing_extensions(available: &[vk::ExtensionProperties]) -> Vec<&'static CStr> {
    pacing_device_extensions()
        .into_iter()
        .filter(|wanted| {
            available
                .iter()
                .map(|ext| ext.extension_name.as_ptr())
                .any(|name| {
                    // Fixed-size, nul-terminated array filled in by the driver
                    let name = unsafe { CStr::from_ptr(name) };
                    match (wanted.to_str(), name.to_str()) {
                        (Ok(wanted), Ok(name)) => wanted == name,
                        _ => false,
                    }
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::extension_properties;

    #[test]
    fn finds_display_timing_among_others() {
        let available = [
            extension_properties(ash::khr::swapchain::NAME),
            extension_properties(ash::google::display_timing::NAME),
        ];
        assert_eq!(
            supported_pacing_extensions(&available),
            vec![ash::google::display_timing::NAME]
        );
    }

    #[test]
    fn ignores_devices_without_display_timing() {
        let available = [extension_properties(ash::khr::swapchain::NAME)];
        assert!(supported_pacing_extensions(&available).is_empty());
    }
}
