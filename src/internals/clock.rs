/// Source of "now" for desired-present-time arithmetic, in nanoseconds.
/// Must share a time base with the presentation engine, which for
/// VK_GOOGLE_display_timing is CLOCK_MONOTONIC.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

#[cfg(unix)]
impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        use rustix::time::{ClockId, clock_gettime};

        let ts = clock_gettime(ClockId::Monotonic);
        let seconds = u64::try_from(ts.tv_sec).unwrap_or(0);
        let nanos = u64::try_from(ts.tv_nsec).unwrap_or(0).min(999_999_999);
        seconds.saturating_mul(1_000_000_000).saturating_add(nanos)
    }
}

#[cfg(not(unix))]
impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;

        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock;
        let first = clock.now_ns();
        let second = clock.now_ns();
        assert!(second >= first);
    }
}
