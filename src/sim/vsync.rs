use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use crate::internals::clock::Clock;
use crate::internals::vsync::{FrameCallback, VsyncSource};

/// Vsync source driven by hand: callbacks fire only when `tick` is called.
#[derive(Default)]
pub struct ManualVsync {
    callbacks: Mutex<Vec<FrameCallback>>,
    posted: Condvar,
    posts: AtomicUsize,
}

impl ManualVsync {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FrameCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fires every posted callback with `frame_time_ns`. Returns how many ran.
    pub fn tick(&self, frame_time_ns: u64) -> usize {
        let callbacks = std::mem::take(&mut *self.lock());
        let fired = callbacks.len();
        for callback in callbacks {
            callback(frame_time_ns);
        }
        fired
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Total callbacks ever posted.
    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for at least one callback to be posted.
    pub fn wait_for_pending(&self, timeout: Duration) -> bool {
        let (callbacks, _) = self.posted
            .wait_timeout_while(self.lock(), timeout, |callbacks| callbacks.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !callbacks.is_empty()
    }
}

impl VsyncSource for ManualVsync {
    fn post_frame_callback(&self, _delay_ms: u32, callback: FrameCallback) {
        self.lock().push(callback);
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.posted.notify_all();
    }
}

struct TickingShared {
    callbacks: Mutex<Vec<FrameCallback>>,
    running: AtomicBool,
}

/// Vsync source firing on a fixed period of `clock`, from its own thread.
pub struct TickingVsync {
    shared: Arc<TickingShared>,
    joiner: Option<JoinHandle<()>>,
}

impl TickingVsync {
    pub fn new(period: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let shared = Arc::new(TickingShared {
            callbacks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });
        let period_ns = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX).max(1);

        let thread_shared = shared.clone();
        let joiner = std::thread::Builder::new()
            .name("vkpace-sim-display".to_string())
            .spawn(move || {
                while thread_shared.running.load(Ordering::Acquire) {
                    let now = clock.now_ns();
                    let next_vsync = (now / period_ns + 1) * period_ns;
                    std::thread::sleep(Duration::from_nanos(next_vsync - now));

                    let callbacks = std::mem::take(
                        &mut *thread_shared.callbacks.lock().unwrap_or_else(PoisonError::into_inner),
                    );
                    for callback in callbacks {
                        callback(next_vsync);
                    }
                }
            })
            .wrap_err("Failed to spawn simulated display thread")?;

        Ok(Self {
            shared,
            joiner: Some(joiner),
        })
    }
}

impl VsyncSource for TickingVsync {
    fn post_frame_callback(&self, _delay_ms: u32, callback: FrameCallback) {
        self.shared.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

impl Drop for TickingVsync {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(joiner) = self.joiner.take() {
            if joiner.join().is_err() {
                log::error!("Simulated display thread panicked");
            }
        }
    }
}
