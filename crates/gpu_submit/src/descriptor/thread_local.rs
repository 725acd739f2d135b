//! Per-context online heap with a fence-gated reclaim pool

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use super::heap::{DescriptorHeap, HeapUsers, OnlineDescriptorHeap, RollOverOutcome};
use crate::error::GpuResult;
use crate::hal::{CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle, NativeDevice, RawDescriptorHeap};
use crate::sync::CompletionToken;

struct RetiredHeap {
    heap: DescriptorHeap,
    users: HeapUsers,
}

/// Online heap owned by one recording context
///
/// When the active heap fills up it is retired to a reclaim pool together with
/// the command lists that referenced it. The oldest retired heap is reused once
/// all of those lists completed; until then a new heap is allocated.
pub struct ThreadLocalHeap {
    device: Arc<dyn NativeDevice>,
    heap_type: DescriptorHeapType,
    capacity: u32,
    active: DescriptorHeap,
    cursor: u32,
    users: HeapUsers,
    reclaim_pool: VecDeque<RetiredHeap>,
    heaps_created: u32,
}

impl ThreadLocalHeap {
    /// Create a heap of `capacity` descriptors
    pub fn new(device: Arc<dyn NativeDevice>, heap_type: DescriptorHeapType, capacity: u32) -> GpuResult<Self> {
        let active = DescriptorHeap::new(Arc::clone(&device), heap_type, capacity, true)?;
        Ok(Self {
            device,
            heap_type,
            capacity,
            active,
            cursor: 0,
            users: HeapUsers::default(),
            reclaim_pool: VecDeque::new(),
            heaps_created: 1,
        })
    }

    /// Backing heaps allocated over the heap's lifetime
    pub const fn heaps_created(&self) -> u32 {
        self.heaps_created
    }

    /// Retired heaps waiting for their users to complete
    pub fn reclaim_pool_len(&self) -> usize {
        self.reclaim_pool.len()
    }
}

impl OnlineDescriptorHeap for ThreadLocalHeap {
    fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    fn raw(&self) -> RawDescriptorHeap {
        self.active.raw()
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn cursor(&self) -> u32 {
        self.cursor
    }

    fn reserve(&mut self, count: u32) -> u32 {
        assert!(
            self.can_reserve(count),
            "{} heap cannot reserve {} slots at {}",
            self.heap_type,
            count,
            self.cursor
        );
        let slot = self.cursor;
        self.cursor += count;
        slot
    }

    fn roll_over(&mut self) -> GpuResult<RollOverOutcome> {
        if self.users.all_complete() {
            self.users.clear();
            self.cursor = 0;
            log::trace!("{} heap {:?} looped around", self.heap_type, self.active.raw());
            return Ok(RollOverOutcome::LoopedAround);
        }

        let next = match self.reclaim_pool.front() {
            Some(retired) if retired.users.all_complete() => self.reclaim_pool.pop_front().map(|r| r.heap),
            _ => None,
        };
        let next = match next {
            Some(heap) => heap,
            None => {
                self.heaps_created += 1;
                log::warn!(
                    "All {} {} heaps still in use, allocating another ({} total); consider raising its capacity",
                    self.reclaim_pool.len() + 1,
                    self.heap_type,
                    self.heaps_created
                );
                DescriptorHeap::new(Arc::clone(&self.device), self.heap_type, self.capacity, true)?
            }
        };

        let retired = std::mem::replace(&mut self.active, next);
        self.reclaim_pool.push_back(RetiredHeap {
            heap: retired,
            users: std::mem::take(&mut self.users),
        });
        self.cursor = 0;
        log::debug!("{} heap rolled over to {:?}", self.heap_type, self.active.raw());
        Ok(RollOverOutcome::RolledOver)
    }

    fn notify_command_list(&mut self, token: &CompletionToken) {
        self.users.add(token);
    }

    fn cpu_handle(&self, slot: u32) -> CpuDescriptorHandle {
        self.active.cpu_handle(slot)
    }

    fn gpu_handle(&self, slot: u32) -> GpuDescriptorHandle {
        self.active.gpu_handle(slot)
    }
}

impl fmt::Debug for ThreadLocalHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalHeap")
            .field("heap_type", &self.heap_type)
            .field("active", &self.active)
            .field("cursor", &self.cursor)
            .field("reclaim_pool", &self.reclaim_pool.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullDevice;

    fn heap(capacity: u32) -> ThreadLocalHeap {
        let device: Arc<dyn NativeDevice> = Arc::new(NullDevice::new());
        ThreadLocalHeap::new(device, DescriptorHeapType::View, capacity).unwrap()
    }

    #[test]
    fn test_sequential_reservations_are_disjoint() {
        let mut heap = heap(256);
        assert_eq!(heap.reserve(10), 0);
        assert_eq!(heap.reserve(10), 10);
        assert_eq!(heap.cursor(), 20);
        assert!(heap.can_reserve(236));
        assert!(!heap.can_reserve(237));
    }

    #[test]
    fn test_idle_heap_loops_around() {
        let mut heap = heap(4);
        let raw = heap.raw();
        heap.reserve(4);

        assert_eq!(heap.roll_over().unwrap(), RollOverOutcome::LoopedAround);
        assert_eq!(heap.raw(), raw);
        assert!(heap.can_reserve(4));
    }

    #[test]
    fn test_busy_heap_rolls_over_and_is_reclaimed_later() {
        let mut heap = heap(4);
        let first_raw = heap.raw();
        let recording = CompletionToken::new();
        heap.notify_command_list(&recording);
        heap.reserve(4);

        assert_eq!(heap.roll_over().unwrap(), RollOverOutcome::RolledOver);
        let second_raw = heap.raw();
        assert_ne!(second_raw, first_raw);
        assert_eq!(heap.heaps_created(), 2);
        assert_eq!(heap.reclaim_pool_len(), 1);

        // The list referencing the first heap finishes; the second heap is busy
        recording.discard();
        let next = CompletionToken::new();
        heap.notify_command_list(&next);
        heap.reserve(4);
        assert_eq!(heap.roll_over().unwrap(), RollOverOutcome::RolledOver);
        assert_eq!(heap.raw(), first_raw);
        assert_eq!(heap.heaps_created(), 2);
    }

    #[test]
    #[should_panic(expected = "cannot reserve")]
    fn test_over_reservation_panics() {
        let mut heap = heap(4);
        heap.reserve(5);
    }
}
