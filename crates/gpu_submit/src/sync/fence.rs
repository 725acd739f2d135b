//! Monotonic queue fences and sync points

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{GpuError, GpuResult};
use crate::hal::{Event, NativeDevice, RawFence, RawQueue};

/// How long a wait sleeps between device-loss checks
const DEVICE_LOST_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Monotonically increasing completion counter for one queue
///
/// Signals are serialized under a lock. Completion queries read a cached value
/// that only ever increases and fall back to the device when the cache is
/// behind.
pub struct Fence {
    device: Arc<dyn NativeDevice>,
    raw: RawFence,
    name: String,
    next_value: Mutex<u64>,
    last_completed: AtomicU64,
    wait_lock: Mutex<()>,
    event: Arc<Event>,
}

impl Fence {
    /// Create a fence; nothing has been signaled yet
    pub fn new(device: Arc<dyn NativeDevice>, name: impl Into<String>) -> GpuResult<Self> {
        let raw = device.create_fence(0)?;
        let name = name.into();
        log::debug!("Created fence '{}' ({:?})", name, raw);
        Ok(Self {
            device,
            raw,
            name,
            next_value: Mutex::new(1),
            last_completed: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
            event: Arc::new(Event::new()),
        })
    }

    /// Native handle
    pub const fn raw(&self) -> RawFence {
        self.raw
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Have `queue` signal the next value once its prior work completes
    pub fn signal(&self, queue: RawQueue) -> GpuResult<u64> {
        let mut next_value = self.next_value.lock();
        let value = *next_value;
        self.device.signal(queue, self.raw, value)?;
        *next_value += 1;
        log::trace!("Fence '{}' signal {}", self.name, value);
        Ok(value)
    }

    /// Most recently issued signal value, 0 if none
    pub fn last_signaled_value(&self) -> u64 {
        *self.next_value.lock() - 1
    }

    /// Cached completed value; may lag behind the device
    pub fn last_completed_value(&self) -> u64 {
        self.last_completed.load(Ordering::Acquire)
    }

    /// Refresh the cached completed value from the device
    pub fn update_last_completed(&self) -> u64 {
        let completed = self.device.completed_value(self.raw);
        let previous = self.last_completed.fetch_max(completed, Ordering::AcqRel);
        previous.max(completed)
    }

    /// Whether `value` has been reached
    pub fn is_complete(&self, value: u64) -> bool {
        value <= self.last_completed_value() || value <= self.update_last_completed()
    }

    /// Block until `value` has been reached
    ///
    /// Returns [`GpuError::DeviceLost`] if the device is removed while waiting.
    pub fn wait_for_fence(&self, value: u64) -> GpuResult<()> {
        if self.is_complete(value) {
            return Ok(());
        }

        let _guard = self.wait_lock.lock();
        self.event.reset();
        self.device.set_event_on_completion(self.raw, value, &self.event)?;

        loop {
            // Stale signals from earlier waits are possible, so always re-check
            self.event.wait_timeout(DEVICE_LOST_POLL_INTERVAL);
            if self.device.is_lost() {
                log::error!("Device lost while waiting for fence '{}' value {}", self.name, value);
                return Err(GpuError::DeviceLost);
            }
            if self.is_complete(value) {
                return Ok(());
            }
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("raw", &self.raw)
            .field("last_completed", &self.last_completed_value())
            .finish_non_exhaustive()
    }
}

/// One value on one fence
///
/// Independent of the command list that produced it; cloning is cheap.
#[derive(Clone)]
pub struct SyncPoint {
    fence: Arc<Fence>,
    value: u64,
}

impl SyncPoint {
    /// Name `value` on `fence`
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    /// Fence the value belongs to
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Fence value
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Whether the GPU has reached this point
    pub fn is_complete(&self) -> bool {
        self.fence.is_complete(self.value)
    }

    /// Block until the GPU has reached this point
    pub fn wait(&self) -> GpuResult<()> {
        self.fence.wait_for_fence(self.value)
    }
}

impl PartialEq for SyncPoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fence, &other.fence) && self.value == other.value
    }
}

impl Eq for SyncPoint {}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("fence", &self.fence.name)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{NullDevice, QueueType};
    use std::thread;

    fn fence_on(device: &Arc<NullDevice>) -> (Arc<Fence>, RawQueue) {
        let queue = device.create_queue(QueueType::Direct).unwrap();
        let fence = Fence::new(Arc::clone(device) as Arc<dyn NativeDevice>, "test").unwrap();
        (Arc::new(fence), queue)
    }

    #[test]
    fn test_signal_values_increase() {
        let device = Arc::new(NullDevice::new());
        let (fence, queue) = fence_on(&device);

        assert_eq!(fence.last_signaled_value(), 0);
        assert_eq!(fence.signal(queue).unwrap(), 1);
        assert_eq!(fence.signal(queue).unwrap(), 2);
        assert_eq!(fence.last_signaled_value(), 2);
        assert!(fence.is_complete(2));
    }

    #[test]
    fn test_is_complete_refreshes_cache() {
        let device = Arc::new(NullDevice::deferred());
        let (fence, queue) = fence_on(&device);

        let value = fence.signal(queue).unwrap();
        assert!(!fence.is_complete(value));
        assert_eq!(fence.last_completed_value(), 0);

        device.complete_all();
        assert!(fence.is_complete(value));
        assert_eq!(fence.last_completed_value(), value);
    }

    #[test]
    fn test_wait_blocks_until_completion() {
        let device = Arc::new(NullDevice::deferred());
        let (fence, queue) = fence_on(&device);
        let sync_point = SyncPoint::new(Arc::clone(&fence), fence.signal(queue).unwrap());

        let completer = Arc::clone(&device);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete_all();
        });

        sync_point.wait().unwrap();
        assert!(sync_point.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_reports_device_loss() {
        let device = Arc::new(NullDevice::deferred());
        let (fence, queue) = fence_on(&device);
        let value = fence.signal(queue).unwrap();

        let remover = Arc::clone(&device);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remover.lose_device();
        });

        assert!(matches!(fence.wait_for_fence(value), Err(GpuError::DeviceLost)));
        handle.join().unwrap();
    }

    #[test]
    fn test_sync_point_equality_is_per_fence() {
        let device = Arc::new(NullDevice::new());
        let (first, _) = fence_on(&device);
        let (second, _) = fence_on(&device);

        assert_eq!(SyncPoint::new(Arc::clone(&first), 1), SyncPoint::new(Arc::clone(&first), 1));
        assert_ne!(SyncPoint::new(first, 1), SyncPoint::new(second, 1));
    }
}
