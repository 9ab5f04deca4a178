use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use crate::vk::{PacingDevice, SyncSlot};

// Upper bound on waiting for in-flight slots while tearing a pool down
const DRAIN_TIMEOUT_NS: u64 = 100_000_000;

/// Free and pending halves of a pool. Every slot lives in exactly one of them.
#[derive(Debug, Default)]
pub struct SyncLists {
    free: VecDeque<SyncSlot>,
    pending: VecDeque<SyncSlot>,
}

impl SyncLists {
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Every slot is in flight; the oldest has to complete before another frame can go out.
    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }

    pub fn oldest_pending(&self) -> Option<SyncSlot> {
        self.pending.front().copied()
    }

    /// Moves the oldest in-flight slot back to the free list. Its fence must already be reset.
    pub fn recycle_oldest(&mut self) -> Option<SyncSlot> {
        let slot = self.pending.pop_front()?;
        self.free.push_back(slot);
        Some(slot)
    }

    /// Marks a free slot as in flight.
    pub fn acquire(&mut self) -> Option<SyncSlot> {
        let slot = self.free.pop_front()?;
        self.pending.push_back(slot);
        Some(slot)
    }

    /// Undoes the latest `acquire` when its submit never reached the queue.
    pub fn release_unsubmitted(&mut self, slot: SyncSlot) {
        if let Some(index) = self.pending.iter().rposition(|s| *s == slot) {
            self.pending.remove(index);
            self.free.push_front(slot);
        }
    }

    fn drain(&mut self) -> (Vec<SyncSlot>, Vec<SyncSlot>) {
        (self.pending.drain(..).collect(), self.free.drain(..).collect())
    }
}

/// Per-queue pool bounding how many presented frames may be in flight.
///
/// Holding the lists lock also serializes presents on the queue.
pub struct SyncPool {
    depth: usize,
    command_pool: vk::CommandPool,
    lists: Mutex<SyncLists>,
    device: Arc<dyn PacingDevice>,
}

impl SyncPool {
    pub fn new(
        device: Arc<dyn PacingDevice>,
        queue_family_index: u32,
        depth: usize,
    ) -> Result<Self> {
        if depth == 0 {
            return Err(eyre!("Sync pool depth must be at least 1"));
        }

        let command_pool = device
            .create_command_pool(queue_family_index)
            .wrap_err_with(|| format!("Failed to create command pool for queue family {queue_family_index}"))?;

        let mut free = VecDeque::with_capacity(depth);
        for _ in 0..depth {
            match device.create_sync_slot(command_pool) {
                Ok(slot) => free.push_back(slot),
                Err(e) => {
                    for slot in &free {
                        device.destroy_sync_slot(command_pool, slot);
                    }
                    device.destroy_command_pool(command_pool);
                    return Err(e).wrap_err("Failed to create frame synchronization objects");
                }
            }
        }

        log::trace!("Created sync pool of depth {depth} for queue family {queue_family_index}");

        Ok(Self {
            depth,
            command_pool,
            lists: Mutex::new(SyncLists {
                free,
                pending: VecDeque::with_capacity(depth),
            }),
            device,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn lock(&self) -> MutexGuard<'_, SyncLists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncPool {
    fn drop(&mut self) {
        let (pending, free) = self.lock().drain();

        // Objects still referenced by queued GPU work must outlive it, so they are leaked
        let mut leaked = 0;
        for slot in &pending {
            match self.device.wait_for_fence(slot.fence, DRAIN_TIMEOUT_NS) {
                Ok(()) => self.device.destroy_sync_slot(self.command_pool, slot),
                Err(e) => {
                    log::warn!("In-flight frame did not complete before sync pool teardown: {e}");
                    leaked += 1;
                }
            }
        }

        for slot in &free {
            self.device.destroy_sync_slot(self.command_pool, slot);
        }

        if leaked == 0 {
            self.device.destroy_command_pool(self.command_pool);
        } else {
            log::error!("Leaking {leaked} in-flight sync slot(s) and their command pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn assert_invariant(pool: &SyncPool) {
        let lists = pool.lock();
        assert_eq!(lists.free_len() + lists.pending_len(), pool.depth());
    }

    #[test]
    fn acquire_and_recycle_preserve_depth() {
        let device = Arc::new(SimDevice::new(1));
        let pool = SyncPool::new(device.clone(), 0, 3).expect("pool");
        assert_invariant(&pool);

        let first = pool.lock().acquire().expect("free slot");
        assert_invariant(&pool);
        let _second = pool.lock().acquire().expect("free slot");
        let _third = pool.lock().acquire().expect("free slot");
        assert_invariant(&pool);
        assert!(pool.lock().is_exhausted());
        assert!(pool.lock().acquire().is_none());

        assert_eq!(pool.lock().oldest_pending(), Some(first));
        assert_eq!(pool.lock().recycle_oldest(), Some(first));
        assert_invariant(&pool);
        assert!(!pool.lock().is_exhausted());
    }

    #[test]
    fn release_unsubmitted_returns_slot_to_front() {
        let device = Arc::new(SimDevice::new(1));
        let pool = SyncPool::new(device, 0, 2).expect("pool");

        let mut lists = pool.lock();
        let slot = lists.acquire().expect("free slot");
        lists.release_unsubmitted(slot);
        assert_eq!(lists.pending_len(), 0);
        assert_eq!(lists.acquire(), Some(slot));
    }

    #[test]
    fn zero_depth_is_rejected() {
        let device = Arc::new(SimDevice::new(1));
        assert!(SyncPool::new(device, 0, 0).is_err());
    }

    #[test]
    fn creation_failure_cleans_up_and_reports_code() {
        let device = Arc::new(SimDevice::new(1));
        device.fail_sync_creation(Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));

        let err = match SyncPool::new(device.clone(), 0, 2) {
            Ok(_) => panic!("creation should fail"),
            Err(e) => e,
        };
        assert_eq!(
            err.downcast_ref::<vk::Result>(),
            Some(&vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn drop_destroys_every_object() {
        let device = Arc::new(SimDevice::new(1));
        {
            let pool = SyncPool::new(device.clone(), 0, 2).expect("pool");
            let slot = pool.lock().acquire().expect("free slot");
            device.signal_fence(slot.fence);
            assert!(device.live_objects() > 0);
        }
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn drop_leaks_slots_still_in_use_by_the_gpu() {
        let device = Arc::new(SimDevice::new(1));
        device.set_gpu_instant(false);
        let stuck = {
            let pool = SyncPool::new(device.clone(), 0, 2).expect("pool");
            let slot = pool.lock().acquire().expect("free slot");
            device.submit_sync(vk::Queue::null(), &[], &slot).expect("submit");
            assert!(!device.is_signalled(slot.fence));
            slot
        };

        // The stuck slot (fence, semaphore, command buffer, event) and the command pool survive
        assert_eq!(device.live_objects(), 5);
        device.signal_fence(stuck.fence);
        assert!(device.is_signalled(stuck.fence));
    }
}
