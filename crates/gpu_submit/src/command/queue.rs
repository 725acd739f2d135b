//! Hardware queues and batch submission

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CommandAllocatorPool, CommandList, CommandListPool};
use crate::config::DeviceConfig;
use crate::error::{DeviceError, GpuError, GpuResult};
use crate::hal::{NativeDevice, QueueType, RawCommandList, RawQueue};
use crate::state::StagedStates;
use crate::sync::{Fence, SyncPoint};

#[derive(Debug, Default)]
struct SubmissionState {
    in_flight: VecDeque<SyncPoint>,
    batches_submitted: u64,
}

/// One hardware queue with its fence, pools and submission lock
///
/// Recording threads obtain lists concurrently; [`Self::execute`] is the
/// serialization point where pending barriers are reconciled against
/// authoritative resource state.
pub struct CommandQueue {
    device: Arc<dyn NativeDevice>,
    queue_type: QueueType,
    raw: RawQueue,
    fence: Arc<Fence>,
    allocators: Mutex<CommandAllocatorPool>,
    lists: Mutex<CommandListPool>,
    submission: Mutex<SubmissionState>,
    device_lost: Arc<AtomicBool>,
    max_in_flight_batches: usize,
}

impl CommandQueue {
    /// Create a queue; `device_lost` is shared with every other queue of the device
    pub fn new(
        device: Arc<dyn NativeDevice>,
        queue_type: QueueType,
        config: &DeviceConfig,
        device_lost: Arc<AtomicBool>,
    ) -> GpuResult<Self> {
        let raw = device.create_queue(queue_type)?;
        let fence = Arc::new(Fence::new(Arc::clone(&device), format!("{queue_type} queue"))?);
        log::info!("Created {} queue {:?}", queue_type, raw);

        Ok(Self {
            allocators: Mutex::new(CommandAllocatorPool::new(Arc::clone(&device), queue_type)),
            lists: Mutex::new(CommandListPool::new(queue_type, config.max_command_lists)),
            device,
            queue_type,
            raw,
            fence,
            submission: Mutex::new(SubmissionState::default()),
            device_lost,
            max_in_flight_batches: config.max_in_flight_batches,
        })
    }

    /// Queue family
    pub const fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Native handle
    pub const fn raw(&self) -> RawQueue {
        self.raw
    }

    /// The queue's fence
    pub const fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Whether the device has been lost
    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// Live command list objects owned by this queue
    pub fn live_command_lists(&self) -> usize {
        self.lists.lock().live()
    }

    /// Submitted batches whose completion has not been observed yet
    pub fn in_flight_batches(&self) -> usize {
        let mut submission = self.submission.lock();
        prune_completed(&mut submission.in_flight);
        submission.in_flight.len()
    }

    /// Take an open command list backed by an idle allocator
    pub fn obtain_command_list(&self) -> GpuResult<CommandList> {
        if self.is_device_lost() {
            return Err(GpuError::DeviceLost);
        }
        let allocator = self.allocators.lock().obtain().map_err(|e| self.observe(e))?;
        self.lists.lock().obtain(&self.device, allocator).map_err(|e| self.observe(e))
    }

    /// Return a list that will not be submitted
    pub fn discard(&self, mut list: CommandList) -> GpuResult<()> {
        assert_eq!(list.queue_type(), self.queue_type, "list discarded on the wrong queue");
        if list.is_open() {
            list.close().map_err(|e| self.observe(e))?;
        }
        list.mark_discarded();
        if let Some(allocator) = list.take_allocator() {
            self.allocators.lock().release(allocator, None);
        }
        log::debug!("Discarded {} command list {:?}", self.queue_type, list.raw());
        self.lists.lock().recycle(list);
        Ok(())
    }

    /// Execute closed lists as one batch and signal one fence value for it
    ///
    /// Each list is preceded by a derived barrier list carrying its resolved
    /// pending barriers, if any. With `wait_for_completion` the call blocks until
    /// the batch has executed.
    pub fn execute(&self, mut lists: Vec<CommandList>, wait_for_completion: bool) -> GpuResult<SyncPoint> {
        if self.is_device_lost() {
            return Err(GpuError::DeviceLost);
        }
        for list in &lists {
            assert!(!list.is_open(), "command list {:?} submitted while recording", list.raw());
            assert_eq!(list.queue_type(), self.queue_type, "command list submitted to the wrong queue");
        }

        let mut submission = self.submission.lock();

        let mut staged = StagedStates::default();
        let mut batch: Vec<RawCommandList> = Vec::with_capacity(lists.len() * 2);
        let mut derived = Vec::new();
        let executed = self
            .prepare_batch(&mut lists, &mut staged, &mut batch, &mut derived)
            .and_then(|()| {
                self.device
                    .execute_command_lists(self.raw, &batch)
                    .map_err(|e| self.observe(GpuError::from(e)))
            });
        if let Err(error) = executed {
            drop(submission);
            log::error!("{} queue failed to execute {} lists: {}", self.queue_type, batch.len(), error);
            self.recycle_unexecuted(lists.into_iter().chain(derived));
            return Err(error);
        }
        staged.apply();

        let value = self.fence.signal(self.raw).map_err(|e| self.observe(e))?;
        let sync_point = SyncPoint::new(Arc::clone(&self.fence), value);

        {
            let mut allocators = self.allocators.lock();
            let mut pool = self.lists.lock();
            for mut list in lists.into_iter().chain(derived) {
                if let Some(allocator) = list.take_allocator() {
                    allocators.release(allocator, Some(sync_point.clone()));
                }
                list.mark_submitted(sync_point.clone());
                pool.recycle(list);
            }
        }

        submission.batches_submitted += 1;
        prune_completed(&mut submission.in_flight);
        submission.in_flight.push_back(sync_point.clone());
        if submission.in_flight.len() > self.max_in_flight_batches {
            log::warn!(
                "{} queue has {} batches in flight (configured for {}); consider raising max_in_flight_batches",
                self.queue_type,
                submission.in_flight.len(),
                self.max_in_flight_batches
            );
        }
        log::debug!(
            "{} queue executed {} lists as batch {} (fence value {})",
            self.queue_type,
            batch.len(),
            submission.batches_submitted,
            value
        );
        drop(submission);

        if wait_for_completion {
            sync_point.wait().map_err(|e| self.observe(e))?;
        }
        Ok(sync_point)
    }

    /// Resolve pending barriers into `staged` and build the native batch,
    /// prepending a derived barrier list where a list needs one
    fn prepare_batch(
        &self,
        lists: &mut [CommandList],
        staged: &mut StagedStates,
        batch: &mut Vec<RawCommandList>,
        derived: &mut Vec<CommandList>,
    ) -> GpuResult<()> {
        for list in lists {
            let barriers = list.tracker_mut().resolve_and_commit(staged);
            if !barriers.is_empty() {
                log::trace!("Prepending {} resolved barriers to {:?}", barriers.len(), list.raw());
                let mut barrier_list = self.obtain_command_list()?;
                barrier_list.resource_barriers(barriers);
                let closed = barrier_list.close().map_err(|e| self.observe(e));
                let raw = barrier_list.raw();
                derived.push(barrier_list);
                closed?;
                batch.push(raw);
            }
            batch.push(list.raw());
        }
        Ok(())
    }

    /// Return the lists of a batch that never reached the GPU
    fn recycle_unexecuted(&self, lists: impl Iterator<Item = CommandList>) {
        for list in lists {
            let raw = list.raw();
            if let Err(error) = self.discard(list) {
                log::warn!("Failed to recycle unexecuted command list {:?}: {}", raw, error);
            }
        }
    }

    /// Signal the fence and block until everything submitted so far has executed
    pub fn wait_for_idle(&self) -> GpuResult<()> {
        if self.is_device_lost() {
            return Err(GpuError::DeviceLost);
        }
        let value = {
            let _submission = self.submission.lock();
            self.fence.signal(self.raw).map_err(|e| self.observe(e))?
        };
        self.fence.wait_for_fence(value).map_err(|e| self.observe(e))
    }

    /// Latch device loss so later submissions short-circuit
    fn observe(&self, error: GpuError) -> GpuError {
        if matches!(error, GpuError::DeviceLost | GpuError::Device(DeviceError::Lost)) {
            if !self.device_lost.swap(true, Ordering::AcqRel) {
                log::error!("Device lost on {} queue; further submissions are disabled", self.queue_type);
            }
            return GpuError::DeviceLost;
        }
        error
    }
}

fn prune_completed(in_flight: &mut VecDeque<SyncPoint>) {
    while in_flight.front().is_some_and(SyncPoint::is_complete) {
        in_flight.pop_front();
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("queue_type", &self.queue_type)
            .field("raw", &self.raw)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}
