use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;

/// Callbacks run once and receive the vsync timestamp in nanoseconds.
pub type FrameCallback = Box<dyn FnOnce(u64) + Send>;

/// Platform facility that calls back once per display refresh (a Choreographer on Android,
/// a compositor clock elsewhere). Each posted callback fires once, at the first vsync after
/// `delay_ms`.
pub trait VsyncSource: Send + Sync {
    fn post_frame_callback(&self, delay_ms: u32, callback: FrameCallback);
}

/// How many vsync callbacks a single request keeps alive before the bridge goes idle.
pub const CALLBACKS_BEFORE_IDLE: u32 = 10;

// Delay handed to the platform when re-arming, matching a "next frame, please" request
const CALLBACK_DELAY_MS: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VsyncState {
    /// Number of vsyncs observed so far.
    pub frame_id: u64,
    /// Frame the next present is allowed to go out on.
    pub target_frame_id: u64,
    /// Timestamp of the latest vsync, nanoseconds.
    pub last_frame_time_ns: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitTimedOut;

/// Single-slot "latest vsync" cell shared by the bridge thread and presenting threads.
/// Publishing overwrites the previous vsync; waiters only ever see the newest one.
#[derive(Default)]
pub struct VsyncChannel {
    state: Mutex<VsyncState>,
    cond: Condvar,
}

impl VsyncChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VsyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, frame_time_ns: u64) {
        {
            let mut state = self.lock();
            state.frame_id += 1;
            state.last_frame_time_ns = frame_time_ns;
        }
        self.cond.notify_all();
    }

    pub fn snapshot(&self) -> VsyncState {
        *self.lock()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut VsyncState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Blocks until `ready` holds. Before every sleep `rearm` is called so a vsync is
    /// guaranteed to be on its way. Gives up once `stall_timeout` passes without any
    /// new vsync arriving.
    ///
    /// `ready` runs under the channel lock and may adjust the state, so keep it short.
    pub fn wait_until(
        &self,
        stall_timeout: Duration,
        mut ready: impl FnMut(&mut VsyncState) -> bool,
        mut rearm: impl FnMut(),
    ) -> std::result::Result<VsyncState, WaitTimedOut> {
        let mut state = self.lock();
        loop {
            if ready(&mut state) {
                return Ok(*state);
            }

            let seen = state.frame_id;
            rearm();
            let (guard, wait) = self.cond
                .wait_timeout_while(state, stall_timeout, |s| s.frame_id == seen)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if wait.timed_out() && state.frame_id == seen {
                return Err(WaitTimedOut);
            }
        }
    }
}

enum Message {
    Request,
    Vsync(u64),
    Exit,
}

/// Background thread turning platform vsync callbacks into `VsyncChannel` updates.
///
/// Responsibilities:
/// - Keep a callback posted while presents keep asking for vsyncs
/// - Go idle after `CALLBACKS_BEFORE_IDLE` callbacks without a request
/// - Advance `frame_id` and wake every waiter on each vsync
pub struct VsyncBridge {
    channel: Arc<VsyncChannel>,
    sender: Sender<Message>,
    joiner: Option<JoinHandle<()>>,
}

impl VsyncBridge {
    pub fn new(source: Arc<dyn VsyncSource>, channel: Arc<VsyncChannel>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let loopback = sender.clone();
        let thread_channel = channel.clone();

        let joiner = std::thread::Builder::new()
            .name("vkpace-vsync".to_string())
            .spawn(move || {
                let post = |loopback: &Sender<Message>| {
                    let loopback = loopback.clone();
                    source.post_frame_callback(CALLBACK_DELAY_MS, Box::new(move |frame_time_ns| {
                        // The bridge may already be gone
                        let _ = loopback.send(Message::Vsync(frame_time_ns));
                    }));
                };

                let mut callbacks_left = 0u32;
                let mut armed = false;

                for msg in &receiver {
                    match msg {
                        Message::Request => {
                            callbacks_left = CALLBACKS_BEFORE_IDLE;
                            if !armed {
                                armed = true;
                                post(&loopback);
                            }
                        }
                        Message::Vsync(frame_time_ns) => {
                            armed = false;
                            thread_channel.publish(frame_time_ns);
                            callbacks_left = callbacks_left.saturating_sub(1);
                            if callbacks_left > 0 {
                                armed = true;
                                post(&loopback);
                            }
                        }
                        Message::Exit => return,
                    }
                }
            })
            .wrap_err("Failed to spawn vsync thread")?;

        log::trace!("Vsync bridge started");

        Ok(Self {
            channel,
            sender,
            joiner: Some(joiner),
        })
    }

    pub fn channel(&self) -> &Arc<VsyncChannel> {
        &self.channel
    }

    /// Asks for the next `CALLBACKS_BEFORE_IDLE` vsyncs.
    pub fn request(&self) {
        if self.sender.send(Message::Request).is_err() {
            log::warn!("Vsync thread has exited, request dropped");
        }
    }
}

impl Drop for VsyncBridge {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Exit);
        if let Some(joiner) = self.joiner.take() {
            if joiner.join().is_err() {
                log::error!("Vsync thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use crate::sim::ManualVsync;

    const LONG: Duration = Duration::from_secs(2);

    fn wait_for_frame(channel: &VsyncChannel, frame_id: u64) -> VsyncState {
        channel
            .wait_until(LONG, |s| s.frame_id >= frame_id, || {})
            .expect("vsync should arrive")
    }

    #[test]
    fn publish_advances_frame_and_overwrites_time() {
        let channel = VsyncChannel::new();
        channel.publish(100);
        channel.publish(250);

        let state = channel.snapshot();
        assert_eq!(state.frame_id, 2);
        assert_eq!(state.last_frame_time_ns, 250);
    }

    #[test]
    fn waiter_wakes_when_vsync_is_published() {
        let channel = Arc::new(VsyncChannel::new());
        let publisher = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                channel.publish(42);
            })
        };

        let state = wait_for_frame(&channel, 1);
        assert_eq!(state.last_frame_time_ns, 42);
        publisher.join().expect("publisher thread");
    }

    #[test]
    fn wait_times_out_without_vsync_progress() {
        let channel = VsyncChannel::new();
        let mut rearms = 0;
        let started = Instant::now();

        let result = channel.wait_until(Duration::from_millis(30), |s| s.frame_id >= 1, || rearms += 1);

        assert_eq!(result, Err(WaitTimedOut));
        assert_eq!(rearms, 1);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn ready_predicate_can_move_the_target() {
        let channel = VsyncChannel::new();
        channel.publish(1);

        let state = channel
            .wait_until(LONG, |s| {
                s.target_frame_id = s.frame_id + 1;
                true
            }, || {})
            .expect("already ready");
        assert_eq!(state.target_frame_id, 2);
        assert_eq!(channel.snapshot().target_frame_id, 2);
    }

    #[test]
    fn bridge_idles_after_callback_budget() {
        let vsync = Arc::new(ManualVsync::new());
        let channel = Arc::new(VsyncChannel::new());
        let bridge = VsyncBridge::new(vsync.clone(), channel.clone()).expect("bridge");

        bridge.request();
        for frame in 1..=CALLBACKS_BEFORE_IDLE as u64 {
            assert!(vsync.wait_for_pending(LONG), "callback {frame} should be posted");
            assert_eq!(vsync.tick(frame * 1_000), 1);
            wait_for_frame(&channel, frame);
        }

        assert!(!vsync.wait_for_pending(Duration::from_millis(50)));
        assert_eq!(vsync.posts(), CALLBACKS_BEFORE_IDLE as usize);
        assert_eq!(channel.snapshot().last_frame_time_ns, CALLBACKS_BEFORE_IDLE as u64 * 1_000);
    }

    #[test]
    fn repeated_requests_keep_a_single_callback_armed() {
        let vsync = Arc::new(ManualVsync::new());
        let channel = Arc::new(VsyncChannel::new());
        let bridge = VsyncBridge::new(vsync.clone(), channel.clone()).expect("bridge");

        bridge.request();
        bridge.request();
        bridge.request();
        assert!(vsync.wait_for_pending(LONG));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(vsync.tick(5), 1);
        wait_for_frame(&channel, 1);
    }
}
