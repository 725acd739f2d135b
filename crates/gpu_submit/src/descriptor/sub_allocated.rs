//! Fixed-size blocks carved out of one device-wide online view heap

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::heap::{DescriptorHeap, HeapUsers, OnlineDescriptorHeap, RollOverOutcome};
use crate::error::GpuResult;
use crate::hal::{CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle, NativeDevice, RawDescriptorHeap};
use crate::sync::CompletionToken;

struct HeapBlock {
    index: u32,
    users: HeapUsers,
}

/// Device-wide view heap split into equally sized blocks
///
/// Blocks circulate through a queue. A block is handed out again only once
/// every command list that referenced it has completed.
pub struct SubAllocatedHeapPool {
    heap: DescriptorHeap,
    block_size: u32,
    block_count: u32,
    free_blocks: Mutex<VecDeque<HeapBlock>>,
}

impl SubAllocatedHeapPool {
    /// Reserve `capacity` view descriptors split into blocks of `block_size`
    pub fn new(device: Arc<dyn NativeDevice>, capacity: u32, block_size: u32) -> GpuResult<Self> {
        assert!(block_size > 0 && block_size <= capacity, "invalid block size {block_size}");
        let heap = DescriptorHeap::new(device, DescriptorHeapType::View, capacity, true)?;
        let block_count = capacity / block_size;
        let free_blocks = (0..block_count)
            .map(|index| HeapBlock {
                index,
                users: HeapUsers::default(),
            })
            .collect();
        log::info!(
            "Sub-allocated view heap: {} blocks of {} descriptors",
            block_count,
            block_size
        );
        Ok(Self {
            heap,
            block_size,
            block_count,
            free_blocks: Mutex::new(free_blocks),
        })
    }

    /// Descriptors per block
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total number of blocks
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Blocks not currently owned by a context
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.lock().len()
    }

    /// Native handle of the shared heap
    pub const fn raw(&self) -> RawDescriptorHeap {
        self.heap.raw()
    }

    fn acquire_block(&self) -> Option<HeapBlock> {
        let mut free_blocks = self.free_blocks.lock();
        let position = free_blocks.iter().position(|block| block.users.all_complete())?;
        let mut block = free_blocks.remove(position)?;
        block.users.clear();
        log::trace!("Acquired view heap block {}", block.index);
        Some(block)
    }

    fn release_block(&self, block: HeapBlock) {
        log::trace!("Released view heap block {} ({} users)", block.index, block.users.len());
        self.free_blocks.lock().push_back(block);
    }

    fn first_slot(&self, block: &HeapBlock) -> u32 {
        block.index * self.block_size
    }
}

impl fmt::Debug for SubAllocatedHeapPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAllocatedHeapPool")
            .field("heap", &self.heap)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

/// One context's view into [`SubAllocatedHeapPool`]
///
/// Owns a single block at a time. The block goes back to the pool when the
/// heap is dropped, still tagged with the lists that used it.
pub struct SubAllocatedHeap {
    pool: Arc<SubAllocatedHeapPool>,
    block: Option<HeapBlock>,
    cursor: u32,
}

impl SubAllocatedHeap {
    /// Take a block from `pool`, or `None` if every block is still in use
    pub fn new(pool: Arc<SubAllocatedHeapPool>) -> Option<Self> {
        let block = pool.acquire_block()?;
        Some(Self {
            pool,
            block: Some(block),
            cursor: 0,
        })
    }

    /// Index of the owned block
    pub fn block_index(&self) -> Option<u32> {
        self.block.as_ref().map(|block| block.index)
    }

    fn block_start(&self) -> u32 {
        self.block.as_ref().map_or(0, |block| self.pool.first_slot(block))
    }
}

impl OnlineDescriptorHeap for SubAllocatedHeap {
    fn heap_type(&self) -> DescriptorHeapType {
        DescriptorHeapType::View
    }

    fn raw(&self) -> RawDescriptorHeap {
        self.pool.raw()
    }

    fn capacity(&self) -> u32 {
        self.pool.block_size
    }

    fn cursor(&self) -> u32 {
        self.cursor
    }

    fn can_reserve(&self, count: u32) -> bool {
        self.block.is_some() && self.cursor.checked_add(count).is_some_and(|end| end <= self.pool.block_size)
    }

    fn reserve(&mut self, count: u32) -> u32 {
        assert!(
            self.can_reserve(count),
            "view heap block cannot reserve {} slots at {}",
            count,
            self.cursor
        );
        let slot = self.cursor;
        self.cursor += count;
        slot
    }

    fn roll_over(&mut self) -> GpuResult<RollOverOutcome> {
        if let Some(block) = self.block.as_mut() {
            if block.users.all_complete() {
                block.users.clear();
                self.cursor = 0;
                return Ok(RollOverOutcome::LoopedAround);
            }
        }

        match self.pool.acquire_block() {
            Some(next) => {
                if let Some(previous) = self.block.replace(next) {
                    self.pool.release_block(previous);
                }
                self.cursor = 0;
                log::debug!("Switched to view heap block {:?}", self.block_index());
                Ok(RollOverOutcome::LoopedAround)
            }
            None => {
                log::warn!(
                    "All {} view heap blocks are in use; consider raising global_view_heap_capacity",
                    self.pool.block_count
                );
                Ok(RollOverOutcome::Exhausted)
            }
        }
    }

    fn notify_command_list(&mut self, token: &CompletionToken) {
        if let Some(block) = self.block.as_mut() {
            block.users.add(token);
        }
    }

    fn cpu_handle(&self, slot: u32) -> CpuDescriptorHandle {
        assert!(slot < self.pool.block_size, "slot {slot} outside view heap block");
        self.pool.heap.cpu_handle(self.block_start() + slot)
    }

    fn gpu_handle(&self, slot: u32) -> GpuDescriptorHandle {
        assert!(slot < self.pool.block_size, "slot {slot} outside view heap block");
        self.pool.heap.gpu_handle(self.block_start() + slot)
    }
}

impl Drop for SubAllocatedHeap {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.pool.release_block(block);
        }
    }
}

impl fmt::Debug for SubAllocatedHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAllocatedHeap")
            .field("block", &self.block_index())
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullDevice;

    fn pool(blocks: u32, block_size: u32) -> Arc<SubAllocatedHeapPool> {
        let device: Arc<dyn NativeDevice> = Arc::new(NullDevice::new());
        Arc::new(SubAllocatedHeapPool::new(device, blocks * block_size, block_size).unwrap())
    }

    #[test]
    fn test_blocks_do_not_overlap() {
        let pool = pool(2, 16);
        let mut first = SubAllocatedHeap::new(Arc::clone(&pool)).unwrap();
        let mut second = SubAllocatedHeap::new(Arc::clone(&pool)).unwrap();
        assert_eq!(pool.free_block_count(), 0);

        let a = first.reserve(16);
        let b = second.reserve(16);
        let stride = first.cpu_handle(1).0 - first.cpu_handle(0).0;
        let first_end = first.cpu_handle(a).0 + 16 * stride;
        assert!(first_end <= second.cpu_handle(b).0 || second.cpu_handle(b).0 + 16 * stride <= first.cpu_handle(a).0);
        assert_eq!(first.raw(), second.raw());
    }

    #[test]
    fn test_starved_pool_reports_exhaustion() {
        let pool = pool(1, 8);
        let mut heap = SubAllocatedHeap::new(Arc::clone(&pool)).unwrap();
        assert!(SubAllocatedHeap::new(Arc::clone(&pool)).is_none());

        let recording = CompletionToken::new();
        heap.notify_command_list(&recording);
        heap.reserve(8);
        assert_eq!(heap.roll_over().unwrap(), RollOverOutcome::Exhausted);

        recording.discard();
        assert_eq!(heap.roll_over().unwrap(), RollOverOutcome::LoopedAround);
        assert!(heap.can_reserve(8));
    }

    #[test]
    fn test_busy_block_switches_to_free_block() {
        let pool = pool(2, 8);
        let mut heap = SubAllocatedHeap::new(Arc::clone(&pool)).unwrap();
        let first_block = heap.block_index();

        let recording = CompletionToken::new();
        heap.notify_command_list(&recording);
        heap.reserve(8);
        assert_eq!(heap.roll_over().unwrap(), RollOverOutcome::LoopedAround);
        assert_ne!(heap.block_index(), first_block);

        // The released block is still referenced by an unfinished list
        assert!(SubAllocatedHeap::new(Arc::clone(&pool)).is_none());
        recording.discard();
        assert!(SubAllocatedHeap::new(Arc::clone(&pool)).is_some());
    }

    #[test]
    fn test_dropped_heap_returns_block() {
        let pool = pool(1, 8);
        drop(SubAllocatedHeap::new(Arc::clone(&pool)).unwrap());
        assert_eq!(pool.free_block_count(), 1);
    }
}
