//! Software device
//!
//! `NullDevice` implements [`NativeDevice`] entirely on the CPU. Recorded ops are
//! kept per command list and appended to a per-queue execution log when a batch
//! executes, descriptor heaps are plain vectors, and fences either complete
//! immediately on signal or wait for [`NullDevice::complete_all`].
//!
//! Descriptor addresses encode the heap id in the upper 32 bits so copies can be
//! resolved back to heap storage.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapInfo, DescriptorHeapType, Event,
    GpuDescriptorHandle, NativeDevice, QueueType, RawCommandAllocator, RawCommandList,
    RawDescriptorHeap, RawFence, RawQueue, RawResource, RecordedOp, ResourceBarrier, ResourceDesc,
    ViewDesc,
};
use crate::error::DeviceError;

const HEAP_ADDRESS_SHIFT: u32 = 32;
const HEAP_OFFSET_MASK: u64 = (1 << HEAP_ADDRESS_SHIFT) - 1;
const VIEW_DESCRIPTOR_SIZE: u32 = 32;
const SAMPLER_DESCRIPTOR_SIZE: u32 = 16;

/// Counters describing what the device has been asked to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullDeviceStats {
    /// Command allocators created
    pub command_allocators_created: u64,
    /// Command allocator resets
    pub command_allocator_resets: u64,
    /// Command lists created
    pub command_lists_created: u64,
    /// Descriptor heaps created
    pub descriptor_heaps_created: u64,
    /// Descriptor heaps destroyed
    pub descriptor_heaps_destroyed: u64,
    /// Calls to either descriptor copy entry point
    pub copy_calls: u64,
    /// Descriptors moved by those calls
    pub descriptors_copied: u64,
    /// `execute_command_lists` calls
    pub batches_executed: u64,
    /// Command lists executed across all batches
    pub lists_executed: u64,
}

#[derive(Debug, Default)]
struct NullFence {
    completed: u64,
    waiters: Vec<(u64, Arc<Event>)>,
}

impl NullFence {
    fn advance(&mut self, value: u64) {
        self.completed = self.completed.max(value);
        let completed = self.completed;
        self.waiters.retain(|(target, event)| {
            if *target <= completed {
                event.signal();
                false
            } else {
                true
            }
        });
    }
}

#[derive(Debug)]
struct NullQueue {
    pending_signals: VecDeque<(RawFence, u64)>,
    executed: Vec<RecordedOp>,
}

#[derive(Debug)]
struct NullList {
    allocator: RawCommandAllocator,
    open: bool,
    ops: Vec<RecordedOp>,
}

#[derive(Debug)]
struct NullHeap {
    increment: u32,
    slots: Vec<Option<ViewDesc>>,
}

#[derive(Debug, Default)]
struct NullState {
    fences: HashMap<RawFence, NullFence>,
    queues: HashMap<RawQueue, NullQueue>,
    lists: HashMap<RawCommandList, NullList>,
    allocators: HashMap<RawCommandAllocator, QueueType>,
    heaps: HashMap<RawDescriptorHeap, NullHeap>,
    resources: HashMap<RawResource, ResourceDesc>,
    stats: NullDeviceStats,
}

impl NullState {
    fn locate(&self, handle: CpuDescriptorHandle) -> (RawDescriptorHeap, usize) {
        let heap = RawDescriptorHeap(handle.0 >> HEAP_ADDRESS_SHIFT);
        let entry = self
            .heaps
            .get(&heap)
            .unwrap_or_else(|| panic!("descriptor handle {:#x} does not belong to a live heap", handle.0));
        let slot = ((handle.0 & HEAP_OFFSET_MASK) / u64::from(entry.increment)) as usize;
        assert!(
            slot < entry.slots.len(),
            "descriptor handle {:#x} is past the end of heap {:?}",
            handle.0,
            heap
        );
        (heap, slot)
    }

    fn read(&self, handle: CpuDescriptorHandle) -> Option<ViewDesc> {
        let (heap, slot) = self.locate(handle);
        self.heaps[&heap].slots[slot]
    }

    fn write(&mut self, handle: CpuDescriptorHandle, value: Option<ViewDesc>) {
        let (heap, slot) = self.locate(handle);
        if let Some(entry) = self.heaps.get_mut(&heap) {
            entry.slots[slot] = value;
        }
    }
}

/// In-process software implementation of [`NativeDevice`]
#[derive(Debug)]
pub struct NullDevice {
    next_id: AtomicU64,
    auto_complete: AtomicBool,
    lost: AtomicBool,
    fail_next_execution: AtomicBool,
    state: Mutex<NullState>,
}

impl NullDevice {
    /// Create a device whose queues complete work as soon as it is signaled
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            auto_complete: AtomicBool::new(true),
            lost: AtomicBool::new(false),
            fail_next_execution: AtomicBool::new(false),
            state: Mutex::new(NullState::default()),
        }
    }

    /// Create a device whose queues only complete work in [`Self::complete_all`]
    pub fn deferred() -> Self {
        let device = Self::new();
        device.set_auto_complete(false);
        device
    }

    /// Switch between immediate and deferred completion
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Release);
        if enabled {
            self.complete_all();
        }
    }

    /// Complete every pending signal on every queue; returns how many fired
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let signals: Vec<(RawFence, u64)> = state
            .queues
            .values_mut()
            .flat_map(|queue| queue.pending_signals.drain(..))
            .collect();

        for &(fence, value) in &signals {
            if let Some(entry) = state.fences.get_mut(&fence) {
                entry.advance(value);
            }
        }
        signals.len()
    }

    /// Complete the oldest pending signal on `queue`, returning its value
    pub fn complete_next(&self, queue: RawQueue) -> Option<u64> {
        let mut state = self.state.lock();
        let (fence, value) = state.queues.get_mut(&queue)?.pending_signals.pop_front()?;
        if let Some(entry) = state.fences.get_mut(&fence) {
            entry.advance(value);
        }
        Some(value)
    }

    /// Signals queued but not yet completed, across all queues
    pub fn pending_signal_count(&self) -> usize {
        let state = self.state.lock();
        state.queues.values().map(|queue| queue.pending_signals.len()).sum()
    }

    /// Simulate device removal
    ///
    /// Like a removed D3D device, every fence reports `u64::MAX` afterwards so
    /// that no waiter blocks forever.
    pub fn lose_device(&self) {
        log::error!("NullDevice: simulating device removal");
        self.lost.store(true, Ordering::Release);
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            fence.advance(u64::MAX);
        }
    }

    /// Reject the next batch execution with an invalid-operation error
    pub fn fail_next_execution(&self) {
        self.fail_next_execution.store(true, Ordering::Release);
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> NullDeviceStats {
        self.state.lock().stats
    }

    /// Zero the operation counters
    pub fn reset_stats(&self) {
        self.state.lock().stats = NullDeviceStats::default();
    }

    /// Every op executed on `queue`, in execution order
    pub fn executed_ops(&self, queue: RawQueue) -> Vec<RecordedOp> {
        let state = self.state.lock();
        state.queues.get(&queue).map(|q| q.executed.clone()).unwrap_or_default()
    }

    /// Every barrier executed on `queue`, in execution order
    pub fn executed_barriers(&self, queue: RawQueue) -> Vec<ResourceBarrier> {
        self.executed_ops(queue)
            .into_iter()
            .filter_map(|op| match op {
                RecordedOp::ResourceBarriers(barriers) => Some(barriers),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Ops currently recorded in `list`
    pub fn recorded_ops(&self, list: RawCommandList) -> Vec<RecordedOp> {
        let state = self.state.lock();
        state.lists.get(&list).map(|l| l.ops.clone()).unwrap_or_default()
    }

    /// Contents of a descriptor slot
    pub fn descriptor_at(&self, handle: CpuDescriptorHandle) -> Option<ViewDesc> {
        self.state.lock().read(handle)
    }

    /// Number of descriptor heaps that have not been destroyed
    pub fn live_descriptor_heaps(&self) -> usize {
        self.state.lock().heaps.len()
    }

    fn next_handle(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        if self.lost.load(Ordering::Acquire) {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDevice for NullDevice {
    fn create_queue(&self, _queue_type: QueueType) -> Result<RawQueue, DeviceError> {
        self.check_lost()?;
        let queue = RawQueue(self.next_handle());
        self.state.lock().queues.insert(
            queue,
            NullQueue {
                pending_signals: VecDeque::new(),
                executed: Vec::new(),
            },
        );
        Ok(queue)
    }

    fn create_command_allocator(&self, queue_type: QueueType) -> Result<RawCommandAllocator, DeviceError> {
        self.check_lost()?;
        let allocator = RawCommandAllocator(self.next_handle());
        let mut state = self.state.lock();
        state.allocators.insert(allocator, queue_type);
        state.stats.command_allocators_created += 1;
        Ok(allocator)
    }

    fn reset_command_allocator(&self, allocator: RawCommandAllocator) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if !state.allocators.contains_key(&allocator) {
            return Err(DeviceError::InvalidOperation {
                reason: format!("unknown command allocator {allocator:?}"),
            });
        }
        let recording = state
            .lists
            .values()
            .any(|list| list.open && list.allocator == allocator);
        if recording {
            return Err(DeviceError::InvalidOperation {
                reason: format!("allocator {allocator:?} is still bound to a recording list"),
            });
        }
        state.stats.command_allocator_resets += 1;
        Ok(())
    }

    fn create_command_list(
        &self,
        queue_type: QueueType,
        allocator: RawCommandAllocator,
    ) -> Result<RawCommandList, DeviceError> {
        self.check_lost()?;
        let list = RawCommandList(self.next_handle());
        let mut state = self.state.lock();
        match state.allocators.get(&allocator) {
            Some(&allocator_type) if allocator_type == queue_type => {}
            _ => {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("allocator {allocator:?} cannot back a {queue_type} list"),
                })
            }
        }
        state.lists.insert(
            list,
            NullList {
                allocator,
                open: true,
                ops: Vec::new(),
            },
        );
        state.stats.command_lists_created += 1;
        Ok(list)
    }

    fn reset_command_list(&self, list: RawCommandList, allocator: RawCommandAllocator) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let entry = state.lists.get_mut(&list).ok_or_else(|| DeviceError::InvalidOperation {
            reason: format!("unknown command list {list:?}"),
        })?;
        if entry.open {
            return Err(DeviceError::InvalidOperation {
                reason: format!("command list {list:?} reset while recording"),
            });
        }
        entry.open = true;
        entry.allocator = allocator;
        entry.ops.clear();
        Ok(())
    }

    fn close_command_list(&self, list: RawCommandList) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let entry = state.lists.get_mut(&list).ok_or_else(|| DeviceError::InvalidOperation {
            reason: format!("unknown command list {list:?}"),
        })?;
        entry.open = false;
        Ok(())
    }

    fn record(&self, list: RawCommandList, op: RecordedOp) {
        let mut state = self.state.lock();
        match state.lists.get_mut(&list) {
            Some(entry) if entry.open => entry.ops.push(op),
            Some(_) => log::warn!("NullDevice: dropped op recorded into closed list {:?}", list),
            None => log::warn!("NullDevice: dropped op recorded into unknown list {:?}", list),
        }
    }

    fn execute_command_lists(&self, queue: RawQueue, lists: &[RawCommandList]) -> Result<(), DeviceError> {
        self.check_lost()?;
        if self.fail_next_execution.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::InvalidOperation {
                reason: format!("execution of {} lists rejected on {queue:?}", lists.len()),
            });
        }
        let mut state = self.state.lock();

        let mut executed = Vec::new();
        for list in lists {
            match state.lists.get(list) {
                Some(entry) if !entry.open => executed.extend(entry.ops.iter().cloned()),
                Some(_) => {
                    return Err(DeviceError::InvalidOperation {
                        reason: format!("command list {list:?} executed while open"),
                    })
                }
                None => {
                    return Err(DeviceError::InvalidOperation {
                        reason: format!("unknown command list {list:?}"),
                    })
                }
            }
        }

        let target = state.queues.get_mut(&queue).ok_or_else(|| DeviceError::InvalidOperation {
            reason: format!("unknown queue {queue:?}"),
        })?;
        target.executed.extend(executed);

        state.stats.batches_executed += 1;
        state.stats.lists_executed += lists.len() as u64;
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<RawFence, DeviceError> {
        self.check_lost()?;
        let fence = RawFence(self.next_handle());
        self.state.lock().fences.insert(
            fence,
            NullFence {
                completed: initial_value,
                waiters: Vec::new(),
            },
        );
        Ok(fence)
    }

    fn signal(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<(), DeviceError> {
        self.check_lost()?;
        let auto_complete = self.auto_complete.load(Ordering::Acquire);
        let mut state = self.state.lock();
        if auto_complete {
            let entry = state.fences.get_mut(&fence).ok_or_else(|| DeviceError::InvalidOperation {
                reason: format!("unknown fence {fence:?}"),
            })?;
            entry.advance(value);
        } else {
            let target = state.queues.get_mut(&queue).ok_or_else(|| DeviceError::InvalidOperation {
                reason: format!("unknown queue {queue:?}"),
            })?;
            target.pending_signals.push_back((fence, value));
        }
        Ok(())
    }

    fn completed_value(&self, fence: RawFence) -> u64 {
        self.state.lock().fences.get(&fence).map_or(0, |entry| entry.completed)
    }

    fn set_event_on_completion(&self, fence: RawFence, value: u64, event: &Arc<Event>) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let entry = state.fences.get_mut(&fence).ok_or_else(|| DeviceError::InvalidOperation {
            reason: format!("unknown fence {fence:?}"),
        })?;
        if entry.completed >= value {
            event.signal();
        } else {
            entry.waiters.push((value, Arc::clone(event)));
        }
        Ok(())
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo, DeviceError> {
        self.check_lost()?;
        let raw = RawDescriptorHeap(self.next_handle());
        let increment = self.descriptor_increment_size(desc.heap_type);
        let base = raw.0 << HEAP_ADDRESS_SHIFT;

        let mut state = self.state.lock();
        state.heaps.insert(
            raw,
            NullHeap {
                increment,
                slots: vec![None; desc.capacity as usize],
            },
        );
        state.stats.descriptor_heaps_created += 1;

        Ok(DescriptorHeapInfo {
            raw,
            cpu_start: CpuDescriptorHandle(base),
            gpu_start: desc.shader_visible.then_some(GpuDescriptorHandle(base)),
            increment,
        })
    }

    fn destroy_descriptor_heap(&self, heap: RawDescriptorHeap) {
        let mut state = self.state.lock();
        if state.heaps.remove(&heap).is_some() {
            state.stats.descriptor_heaps_destroyed += 1;
        }
    }

    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32 {
        match heap_type {
            DescriptorHeapType::View => VIEW_DESCRIPTOR_SIZE,
            DescriptorHeapType::Sampler => SAMPLER_DESCRIPTOR_SIZE,
        }
    }

    fn create_view(&self, dst: CpuDescriptorHandle, desc: &ViewDesc) {
        self.state.lock().write(dst, Some(*desc));
    }

    fn copy_descriptors(&self, dst: CpuDescriptorHandle, src: &[CpuDescriptorHandle], heap_type: DescriptorHeapType) {
        let increment = self.descriptor_increment_size(heap_type);
        let mut state = self.state.lock();
        let values: Vec<Option<ViewDesc>> = src.iter().map(|&handle| state.read(handle)).collect();
        for (index, value) in values.into_iter().enumerate() {
            state.write(dst.offset(index as u32, increment), value);
        }
        state.stats.copy_calls += 1;
        state.stats.descriptors_copied += src.len() as u64;
    }

    fn copy_descriptors_simple(
        &self,
        count: u32,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        heap_type: DescriptorHeapType,
    ) {
        let increment = self.descriptor_increment_size(heap_type);
        let mut state = self.state.lock();
        let values: Vec<Option<ViewDesc>> = (0..count)
            .map(|index| state.read(src.offset(index, increment)))
            .collect();
        for (index, value) in values.into_iter().enumerate() {
            state.write(dst.offset(index as u32, increment), value);
        }
        state.stats.copy_calls += 1;
        state.stats.descriptors_copied += u64::from(count);
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<RawResource, DeviceError> {
        self.check_lost()?;
        let resource = RawResource(self.next_handle());
        self.state.lock().resources.insert(resource, desc.clone());
        Ok(resource)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}
