use std::collections::VecDeque;
use crate::core::state::{PacingState, PipelineMode, swap_interval_for};

/// Samples averaged before the controller reconsiders the swap interval.
pub const SAMPLE_WINDOW: usize = 60;
// Anything slower is a hitch and would skew the average
const MAX_FRAME_DURATION_NS: u64 = 100_000_000;
const FRAME_HYSTERESIS_NS: u64 = 3_000_000;

/// CPU and GPU time spent on one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameDuration {
    cpu_ns: u64,
    gpu_ns: u64,
}

impl FrameDuration {
    pub fn new(cpu_ns: u64, gpu_ns: u64) -> Self {
        Self {
            cpu_ns: cpu_ns.min(MAX_FRAME_DURATION_NS),
            gpu_ns: gpu_ns.min(MAX_FRAME_DURATION_NS),
        }
    }

    /// Frame time when CPU and GPU overlap.
    pub fn pipelined_ns(&self) -> u64 {
        self.cpu_ns.max(self.gpu_ns)
    }

    /// Frame time when CPU and GPU run back to back.
    pub fn serial_ns(&self) -> u64 {
        self.cpu_ns + self.gpu_ns
    }

    pub fn for_mode(&self, mode: PipelineMode) -> u64 {
        match mode {
            PipelineMode::On => self.pipelined_ns(),
            PipelineMode::Off => self.serial_ns(),
        }
    }
}

/// Sliding-window controller picking the swap interval and pipeline mode
/// from recent frame durations.
pub struct AutoSwapInterval {
    samples: VecDeque<FrameDuration>,
    cpu_sum_ns: u64,
    gpu_sum_ns: u64,
    max_frame_budget_ns: u64,
}

impl AutoSwapInterval {
    pub fn new(max_frame_budget_ns: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            cpu_sum_ns: 0,
            gpu_sum_ns: 0,
            max_frame_budget_ns,
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.cpu_sum_ns = 0;
        self.gpu_sum_ns = 0;
    }

    fn push(&mut self, sample: FrameDuration) {
        if self.samples.len() == SAMPLE_WINDOW {
            if let Some(oldest) = self.samples.pop_front() {
                self.cpu_sum_ns -= oldest.cpu_ns;
                self.gpu_sum_ns -= oldest.gpu_ns;
            }
        }
        self.cpu_sum_ns += sample.cpu_ns;
        self.gpu_sum_ns += sample.gpu_ns;
        self.samples.push_back(sample);
    }

    fn average(&self) -> FrameDuration {
        let n = self.samples.len().max(1) as u64;
        FrameDuration::new(self.cpu_sum_ns / n, self.gpu_sum_ns / n)
    }

    /// Adds a sample and, once the window is full, may retune `state`.
    /// Returns whether the swap interval or pipeline mode changed.
    pub fn record(&mut self, sample: FrameDuration, state: &mut PacingState) -> bool {
        if !state.auto_swap_interval {
            return false;
        }

        self.push(sample);
        if self.samples.len() < SAMPLE_WINDOW {
            return false;
        }

        let before = (state.swap_interval, state.pipeline_mode);
        self.update(state);
        let changed = before != (state.swap_interval, state.pipeline_mode);
        if changed {
            log::debug!(
                "Auto swap interval: {} -> {}, pipelining {:?} -> {:?}",
                before.0, state.swap_interval, before.1, state.pipeline_mode
            );
            self.clear();
        }
        changed
    }

    fn update(&self, state: &mut PacingState) {
        let average = self.average();
        let refresh = state.refresh_duration_ns;
        let interval = u64::from(state.swap_interval);

        let pipelined = average.pipelined_ns();
        let serial = average.serial_ns();
        let current = average.for_mode(state.pipeline_mode);

        let upper = (refresh * interval).saturating_sub(FRAME_HYSTERESIS_NS);
        // Hysteresis applied twice so frames right at the edge don't flip back and forth
        let lower = (refresh * interval.saturating_sub(1)).saturating_sub(2 * FRAME_HYSTERESIS_NS);
        let target = self.clamp_interval(swap_interval_for(pipelined + FRAME_HYSTERESIS_NS, refresh), state);

        if current > upper {
            if state.pipeline_mode == PipelineMode::Off && pipelined <= upper {
                state.pipeline_mode = PipelineMode::On;
            } else {
                self.change_interval(state, target, serial);
            }
        } else if state.swap_interval_ns <= refresh * interval.saturating_sub(1) && pipelined < lower {
            self.change_interval(state, target, serial);
        } else if pipelining_not_needed(state, serial, upper) {
            state.pipeline_mode = PipelineMode::Off;
        }
    }

    fn change_interval(&self, state: &mut PacingState, swap_interval: u32, serial_ns: u64) {
        state.swap_interval = swap_interval;
        let upper = state.frame_budget_ns().saturating_sub(FRAME_HYSTERESIS_NS);
        state.pipeline_mode = if pipelining_not_needed(state, serial_ns, upper) {
            PipelineMode::Off
        } else {
            PipelineMode::On
        };
    }

    fn clamp_interval(&self, swap_interval: u32, state: &PacingState) -> u32 {
        let max = swap_interval_for(self.max_frame_budget_ns, state.refresh_duration_ns);
        swap_interval.min(max).max(state.requested_swap_interval())
    }
}

fn pipelining_not_needed(state: &PacingState, serial_ns: u64, upper_ns: u64) -> bool {
    state.auto_pipeline_mode && serial_ns < upper_ns.saturating_sub(2 * FRAME_HYSTERESIS_NS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PacingConfig;

    const REFRESH: u64 = 16_666_666;
    const MS: u64 = 1_000_000;

    fn auto_state() -> PacingState {
        let mut state = PacingState::new(&PacingConfig::default());
        state.set_auto_swap_interval(true);
        state
    }

    fn feed(controller: &mut AutoSwapInterval, state: &mut PacingState, sample: FrameDuration) -> bool {
        let mut changed = false;
        for _ in 0..SAMPLE_WINDOW {
            changed |= controller.record(sample, state);
        }
        changed
    }

    #[test]
    fn durations_are_clamped() {
        let frame = FrameDuration::new(500 * MS, 5 * MS);
        assert_eq!(frame.pipelined_ns(), 100 * MS);
        assert_eq!(frame.serial_ns(), 105 * MS);
    }

    #[test]
    fn disabled_controller_ignores_samples() {
        let mut controller = AutoSwapInterval::new(50 * MS);
        let mut state = PacingState::new(&PacingConfig::default());
        assert!(!feed(&mut controller, &mut state, FrameDuration::new(30 * MS, 0)));
        assert_eq!(state.swap_interval, 1);
    }

    #[test]
    fn nothing_changes_before_the_window_fills() {
        let mut controller = AutoSwapInterval::new(50 * MS);
        let mut state = auto_state();
        for _ in 0..SAMPLE_WINDOW - 1 {
            assert!(!controller.record(FrameDuration::new(30 * MS, 0), &mut state));
        }
        assert_eq!(state.swap_interval, 1);
    }

    #[test]
    fn slow_frames_raise_the_interval() {
        let mut controller = AutoSwapInterval::new(50 * MS);
        let mut state = auto_state();

        assert!(feed(&mut controller, &mut state, FrameDuration::new(25 * MS, 10 * MS)));
        assert_eq!(state.swap_interval, 2);
        assert_eq!(state.pipeline_mode, PipelineMode::On);
    }

    #[test]
    fn interval_is_capped_by_max_frame_budget() {
        let mut controller = AutoSwapInterval::new(50 * MS);
        let mut state = auto_state();

        feed(&mut controller, &mut state, FrameDuration::new(90 * MS, 0));
        assert_eq!(state.swap_interval, 3);
    }

    #[test]
    fn fast_frames_lower_the_interval_but_not_below_request() {
        let mut controller = AutoSwapInterval::new(50 * MS);
        let mut state = auto_state();
        state.swap_interval = 3;

        assert!(feed(&mut controller, &mut state, FrameDuration::new(8 * MS, 4 * MS)));
        assert_eq!(state.swap_interval, 1);

        state.set_swap_interval_ns(2 * REFRESH);
        state.swap_interval = 3;
        feed(&mut controller, &mut state, FrameDuration::new(8 * MS, 4 * MS));
        assert_eq!(state.swap_interval, 2);
    }

    #[test]
    fn pipelining_turns_off_when_serial_work_fits() {
        let mut controller = AutoSwapInterval::new(50 * MS);
        let mut state = auto_state();
        state.set_auto_pipeline_mode(true);

        assert!(feed(&mut controller, &mut state, FrameDuration::new(4 * MS, 3 * MS)));
        assert_eq!(state.swap_interval, 1);
        assert_eq!(state.pipeline_mode, PipelineMode::Off);

        // Serial work no longer fits: pipelining comes back before the interval moves
        assert!(feed(&mut controller, &mut state, FrameDuration::new(10 * MS, 5 * MS)));
        assert_eq!(state.pipeline_mode, PipelineMode::On);
        assert_eq!(state.swap_interval, 1);
    }
}
