use ash::prelude::VkResult;
use ash::vk;
use smallvec::SmallVec;
use crate::pacing::timeline::SwapchainTimeline;
use crate::pacing::{PacingCore, PacingStrategy, StrategyKind};
use crate::vk::PresentInfo;

// A frame landing less than this after its desired time was nearly late
const TOO_CLOSE_TO_VSYNC_NS: i64 = 3_000_000;
// A frame landing more than this after its desired time waited needlessly
const TOO_FAR_FROM_VSYNC_NS: i64 = 7_000_000;
const NUDGE_NS: u64 = 2_000_000;
// Presents to skip after a nudge before feedback is read again
const FEEDBACK_COOLDOWN: u32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nudge {
    Earlier,
    Later,
}

/// Applies at most one correction from completed-present records and starts the cooldown.
pub fn apply_feedback(
    timeline: &mut SwapchainTimeline,
    records: &[vk::PastPresentationTimingGOOGLE],
) -> Option<Nudge> {
    let desired = timeline.next_desired_present_time?;

    for record in records {
        let early_by = record.actual_present_time.wrapping_sub(record.desired_present_time) as i64;
        let (nudge, corrected) = if early_by < TOO_CLOSE_TO_VSYNC_NS {
            (Nudge::Earlier, desired.saturating_sub(NUDGE_NS))
        } else if early_by > TOO_FAR_FROM_VSYNC_NS {
            (Nudge::Later, desired.saturating_add(NUDGE_NS))
        } else {
            continue;
        };

        log::debug!(
            "Present {} landed {early_by} ns after its desired time, nudging {nudge:?}",
            record.present_id
        );
        timeline.next_desired_present_time = Some(corrected);
        timeline.next_present_id_to_check = timeline.next_present_id.wrapping_add(FEEDBACK_COOLDOWN);
        return Some(nudge);
    }

    None
}

/// Schedules presents with VK_GOOGLE_display_timing and trims the schedule from the
/// display's own record of when earlier frames actually appeared.
pub struct DisplayTiming {
    core: PacingCore,
}

impl DisplayTiming {
    pub fn new(core: PacingCore) -> Self {
        Self { core }
    }

    fn check_past_present_timing(&self, swapchain: vk::SwapchainKHR, timeline: &mut SwapchainTimeline) {
        if timeline.next_present_id <= timeline.next_present_id_to_check {
            return;
        }

        match self.core.device().past_presentation_timing(swapchain) {
            Ok(records) => {
                apply_feedback(timeline, &records);
            }
            Err(e) => log::debug!("Skipping present timing feedback: {e}"),
        }
    }

    fn next_desired_present_time(
        &self,
        swapchain: vk::SwapchainKHR,
        timeline: &mut SwapchainTimeline,
        now: u64,
        refresh_duration_ns: u64,
        frame_budget_ns: u64,
    ) -> u64 {
        if timeline.next_desired_present_time.is_none() {
            return now + refresh_duration_ns;
        }

        self.check_past_present_timing(swapchain, timeline);
        let next = timeline
            .next_desired_present_time
            .unwrap_or(now)
            .saturating_add(frame_budget_ns);

        // Running late: aim for the next refresh rather than bursting to catch up
        if next < now {
            now + refresh_duration_ns
        } else {
            next
        }
    }
}

impl PacingStrategy for DisplayTiming {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DisplayTiming
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
        _queue_family_index: u32,
        info: &PresentInfo<'_>,
    ) -> vk::Result {
        let (refresh_duration_ns, frame_budget_ns) = {
            let state = self.core.state();
            (state.refresh_duration_ns, state.frame_budget_ns())
        };
        let now = self.core.now_ns();

        let mut times: SmallVec<[vk::PresentTimeGOOGLE; 4]> = SmallVec::new();
        {
            let mut timelines = self.core.timelines();
            for &swapchain in info.swapchains {
                let timeline = timelines.entry(swapchain);
                let desired = self.next_desired_present_time(
                    swapchain,
                    timeline,
                    now,
                    refresh_duration_ns,
                    frame_budget_ns,
                );
                timeline.next_desired_present_time = Some(desired);
                times.push(timelines.issue(swapchain, desired));
            }
        }

        log::trace!("Presenting {times:?}");
        self.core.device().queue_present(queue, info, Some(&times))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ash::vk::Handle;
    use crate::core::config::PacingConfig;
    use crate::core::state::PacingState;
    use crate::sim::{ManualClock, SimDevice, TimingModel};

    const REFRESH: u64 = 16_666_666;
    const T: u64 = 1_000_000_000;

    fn setup() -> (Arc<SimDevice>, Arc<ManualClock>, DisplayTiming) {
        let device = Arc::new(SimDevice::new(1));
        let clock = Arc::new(ManualClock::new(T));
        let state = PacingState::new(&PacingConfig::default());
        let strategy = DisplayTiming::new(PacingCore::new(device.clone(), clock.clone(), state, 0));
        (device, clock, strategy)
    }

    fn present(strategy: &DisplayTiming, swapchain: vk::SwapchainKHR) -> vk::Result {
        let swapchains = [swapchain];
        strategy.queue_present(vk::Queue::from_raw(1), 0, &PresentInfo::new(&[], &swapchains, &[0]))
    }

    fn record(early_by: u64) -> vk::PastPresentationTimingGOOGLE {
        vk::PastPresentationTimingGOOGLE {
            present_id: 0,
            desired_present_time: T,
            actual_present_time: T + early_by,
            earliest_present_time: T + early_by,
            present_margin: 0,
        }
    }

    fn timeline_at(next_present_id: u32, desired: u64) -> SwapchainTimeline {
        SwapchainTimeline {
            next_present_id,
            next_desired_present_time: Some(desired),
            next_present_id_to_check: 2,
        }
    }

    fn desired_times(device: &SimDevice) -> Vec<u64> {
        device
            .presents()
            .iter()
            .flat_map(|p| p.times.clone().unwrap_or_default())
            .map(|t| t.desired_present_time)
            .collect()
    }

    #[test]
    fn first_present_targets_next_refresh() {
        let (device, _clock, strategy) = setup();
        assert_eq!(present(&strategy, vk::SwapchainKHR::from_raw(9)), vk::Result::SUCCESS);

        let presents = device.presents();
        let times = presents[0].times.as_ref().expect("present times injected");
        assert_eq!(times.len(), 1);
        assert_eq!(times[0].present_id, 0);
        assert_eq!(times[0].desired_present_time, T + REFRESH);
    }

    #[test]
    fn too_close_record_moves_earlier_by_exactly_one_nudge() {
        let mut timeline = timeline_at(3, 5 * T);
        let nudge = apply_feedback(&mut timeline, &[record(1_000_000)]);

        assert_eq!(nudge, Some(Nudge::Earlier));
        assert_eq!(timeline.next_desired_present_time, Some(5 * T - 2_000_000));
        assert_eq!(timeline.next_present_id_to_check, 3 + 7);
    }

    #[test]
    fn too_far_record_moves_later() {
        let mut timeline = timeline_at(3, 5 * T);
        assert_eq!(apply_feedback(&mut timeline, &[record(9_000_000)]), Some(Nudge::Later));
        assert_eq!(timeline.next_desired_present_time, Some(5 * T + 2_000_000));
    }

    #[test]
    fn records_inside_the_window_change_nothing() {
        for early_by in [3_000_000, 5_000_000, 7_000_000] {
            let mut timeline = timeline_at(3, 5 * T);
            let before = timeline;
            assert_eq!(apply_feedback(&mut timeline, &[record(early_by)]), None);
            assert_eq!(timeline, before);
        }
    }

    #[test]
    fn several_close_records_in_one_batch_nudge_once() {
        let mut timeline = timeline_at(3, 5 * T);
        let records = [record(0), record(1_000_000), record(2_000_000)];
        assert_eq!(apply_feedback(&mut timeline, &records), Some(Nudge::Earlier));
        assert_eq!(timeline.next_desired_present_time, Some(5 * T - 2_000_000));
    }

    #[test]
    fn late_record_before_present_moves_desired_time_by_two_ms() {
        let swapchain = vk::SwapchainKHR::from_raw(9);

        // Same present sequence with and without a close-to-vsync record
        let run = |with_feedback: bool| {
            let (device, clock, strategy) = setup();
            for _ in 0..3 {
                present(&strategy, swapchain);
                clock.advance(REFRESH);
            }
            if with_feedback {
                device.push_past_timing(swapchain, 0, T + REFRESH, T + REFRESH + 1_000_000);
            }
            present(&strategy, swapchain);
            let timeline = *strategy.core().timelines().get(swapchain).expect("timeline");
            (desired_times(&device), timeline)
        };

        let (baseline, _) = run(false);
        let (nudged, timeline) = run(true);
        assert_eq!(baseline[3] - nudged[3], 2_000_000);
        assert_eq!(timeline.next_present_id_to_check, 3 + 7);
        assert_eq!(timeline.next_present_id, 4);
    }

    #[test]
    fn cooldown_allows_one_nudge_per_seven_presents() {
        let (device, clock, strategy) = setup();
        let swapchain = vk::SwapchainKHR::from_raw(9);
        device.set_timing_model(TimingModel::Offset(0));

        for _ in 0..10 {
            present(&strategy, swapchain);
            clock.advance(REFRESH);
        }

        // Every frame lands too close to vsync; the cooldown keeps presents 4..=10 from reading it
        let desired = desired_times(&device);
        let steps: Vec<u64> = desired.windows(2).map(|w| w[1] - w[0]).collect();
        let nudged = steps.iter().filter(|&&step| step == REFRESH - 2_000_000).count();
        assert_eq!(nudged, 1);
        assert_eq!(steps[2], REFRESH - 2_000_000);
    }

    #[test]
    fn late_producer_gets_one_refresh_of_grace() {
        let (device, clock, strategy) = setup();
        let swapchain = vk::SwapchainKHR::from_raw(9);

        present(&strategy, swapchain);
        clock.advance(10 * REFRESH);
        present(&strategy, swapchain);

        let desired = desired_times(&device);
        assert_eq!(desired[1], T + 10 * REFRESH + REFRESH);
    }

    #[test]
    fn swap_interval_spaces_presents() {
        let (device, clock, strategy) = setup();
        let swapchain = vk::SwapchainKHR::from_raw(9);
        strategy.set_swap_interval_ns(swapchain, 2 * REFRESH);

        present(&strategy, swapchain);
        clock.advance(REFRESH);
        present(&strategy, swapchain);

        let desired = desired_times(&device);
        assert_eq!(desired[1] - desired[0], 2 * REFRESH);
    }

    #[test]
    fn feedback_query_failure_is_ignored() {
        let (device, clock, strategy) = setup();
        let swapchain = vk::SwapchainKHR::from_raw(9);
        device.fail_past_timing(Some(vk::Result::ERROR_SURFACE_LOST_KHR));

        for _ in 0..5 {
            assert_eq!(present(&strategy, swapchain), vk::Result::SUCCESS);
            clock.advance(REFRESH);
        }
        let desired = desired_times(&device);
        assert!(desired.windows(2).all(|w| w[1] - w[0] == REFRESH));
    }

    #[test]
    fn present_ids_increase_per_swapchain() {
        let (device, _clock, strategy) = setup();
        let a = vk::SwapchainKHR::from_raw(9);
        let b = vk::SwapchainKHR::from_raw(10);
        let swapchains = [a, b];

        for _ in 0..3 {
            strategy.queue_present(vk::Queue::from_raw(1), 0, &PresentInfo::new(&[], &swapchains, &[0, 0]));
        }

        for (index, swapchain) in swapchains.iter().enumerate() {
            let ids: Vec<u32> = device
                .presents()
                .iter()
                .filter_map(|p| p.times.as_ref().map(|t| t[index].present_id))
                .collect();
            assert!(ids.windows(2).all(|w| w[1] > w[0]), "ids for {swapchain:?}: {ids:?}");
        }
        // The second swapchain started above the id the first one had just issued
        assert_eq!(strategy.present_id_watermark(), 4);
    }

    #[test]
    fn refresh_query_failure_is_reported() {
        let (device, _clock, strategy) = setup();
        device.set_refresh_result(Err(vk::Result::ERROR_SURFACE_LOST_KHR));

        assert_eq!(
            strategy.refresh_cycle_duration(vk::SwapchainKHR::from_raw(9)),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR)
        );
        assert_eq!(strategy.core().state().refresh_duration_ns, REFRESH);
    }
}
