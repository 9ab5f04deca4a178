use std::collections::HashMap;
use ash::vk;

/// Presents a fresh swapchain makes before its first look at timing feedback.
pub const FIRST_FEEDBACK_DELAY: u32 = 2;

/// Present-time bookkeeping for one swapchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainTimeline {
    pub next_present_id: u32,
    /// Unset until the swapchain's first present.
    pub next_desired_present_time: Option<u64>,
    /// Feedback is ignored until `next_present_id` moves past this.
    pub next_present_id_to_check: u32,
}

impl SwapchainTimeline {
    pub fn starting_at(first_present_id: u32) -> Self {
        Self {
            next_present_id: first_present_id,
            next_desired_present_time: None,
            next_present_id_to_check: first_present_id.saturating_add(FIRST_FEEDBACK_DELAY),
        }
    }

    /// Hands out the next present id for a frame wanted at `desired_present_time`.
    pub fn issue(&mut self, desired_present_time: u64) -> vk::PresentTimeGOOGLE {
        let present_id = self.next_present_id;
        self.next_present_id = self.next_present_id.wrapping_add(1);
        vk::PresentTimeGOOGLE {
            present_id,
            desired_present_time,
        }
    }
}

/// All swapchain timelines of one device.
///
/// New swapchains start above every id the device has handed out so far,
/// so ids are never reused when a swapchain is recreated.
#[derive(Debug, Default)]
pub struct Timelines {
    watermark: u32,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainTimeline>,
}

impl Timelines {
    pub fn new(watermark: u32) -> Self {
        Self {
            watermark,
            swapchains: HashMap::new(),
        }
    }

    pub fn entry(&mut self, swapchain: vk::SwapchainKHR) -> &mut SwapchainTimeline {
        let watermark = self.watermark;
        self.swapchains
            .entry(swapchain)
            .or_insert_with(|| SwapchainTimeline::starting_at(watermark))
    }

    pub fn get(&self, swapchain: vk::SwapchainKHR) -> Option<&SwapchainTimeline> {
        self.swapchains.get(&swapchain)
    }

    /// Issues an id from `swapchain`'s timeline and raises the device watermark past it.
    pub fn issue(
        &mut self,
        swapchain: vk::SwapchainKHR,
        desired_present_time: u64,
    ) -> vk::PresentTimeGOOGLE {
        let time = self.entry(swapchain).issue(desired_present_time);
        self.watermark = self.watermark.max(time.present_id.wrapping_add(1));
        time
    }

    pub fn forget(&mut self, swapchain: vk::SwapchainKHR) {
        self.swapchains.remove(&swapchain);
    }

    pub fn watermark(&self) -> u32 {
        self.watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn fresh_timeline_defers_first_feedback_check() {
        let timeline = SwapchainTimeline::starting_at(0);
        assert_eq!(timeline.next_present_id, 0);
        assert_eq!(timeline.next_desired_present_time, None);
        assert_eq!(timeline.next_present_id_to_check, 2);
    }

    #[test]
    fn recreated_swapchain_continues_above_watermark() {
        let old = vk::SwapchainKHR::from_raw(1);
        let new = vk::SwapchainKHR::from_raw(2);
        let mut timelines = Timelines::new(0);

        let ids: Vec<u32> = (0..3).map(|_| timelines.issue(old, 0).present_id).collect();
        assert_eq!(ids, [0, 1, 2]);

        timelines.forget(old);
        assert_eq!(timelines.issue(new, 0).present_id, 3);
        assert_eq!(timelines.get(new).map(|t| t.next_present_id_to_check), Some(5));
        assert_eq!(timelines.watermark(), 4);
    }
}
