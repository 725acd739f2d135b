//! Command allocators and their fence-gated pool

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::error::GpuResult;
use crate::hal::{NativeDevice, QueueType, RawCommandAllocator};
use crate::sync::SyncPoint;

/// Backing memory for one command list's recorded commands
#[derive(Debug)]
pub struct CommandAllocator {
    raw: RawCommandAllocator,
    last_use: Option<SyncPoint>,
}

impl CommandAllocator {
    /// Native handle
    pub const fn raw(&self) -> RawCommandAllocator {
        self.raw
    }

    /// Sync point of the last submission that used this allocator
    pub const fn last_use(&self) -> Option<&SyncPoint> {
        self.last_use.as_ref()
    }

    /// Whether the GPU is done with every command recorded into it
    pub fn is_idle(&self) -> bool {
        self.last_use.as_ref().map_or(true, SyncPoint::is_complete)
    }
}

/// Allocators for one queue type, released in submission order
pub struct CommandAllocatorPool {
    device: Arc<dyn NativeDevice>,
    queue_type: QueueType,
    released: VecDeque<CommandAllocator>,
    created: usize,
}

impl CommandAllocatorPool {
    /// Create an empty pool
    pub fn new(device: Arc<dyn NativeDevice>, queue_type: QueueType) -> Self {
        Self {
            device,
            queue_type,
            released: VecDeque::new(),
            created: 0,
        }
    }

    /// Take an allocator that is safe to record into
    ///
    /// The oldest released allocator is reset and reused once its last sync
    /// point has completed; otherwise a new allocator is created.
    pub fn obtain(&mut self) -> GpuResult<CommandAllocator> {
        if self.released.front().is_some_and(CommandAllocator::is_idle) {
            if let Some(mut allocator) = self.released.pop_front() {
                self.device.reset_command_allocator(allocator.raw)?;
                allocator.last_use = None;
                log::trace!("Reusing {} command allocator {:?}", self.queue_type, allocator.raw);
                return Ok(allocator);
            }
        }

        let raw = self.device.create_command_allocator(self.queue_type)?;
        self.created += 1;
        log::debug!(
            "Created {} command allocator {:?} ({} total)",
            self.queue_type,
            raw,
            self.created
        );
        Ok(CommandAllocator { raw, last_use: None })
    }

    /// Return an allocator; `last_use` gates its next reset
    pub fn release(&mut self, mut allocator: CommandAllocator, last_use: Option<SyncPoint>) {
        allocator.last_use = last_use;
        self.released.push_back(allocator);
    }

    /// Allocators waiting in the pool
    pub fn available(&self) -> usize {
        self.released.len()
    }

    /// Allocators created over the pool's lifetime
    pub const fn created(&self) -> usize {
        self.created
    }
}

impl fmt::Debug for CommandAllocatorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAllocatorPool")
            .field("queue_type", &self.queue_type)
            .field("available", &self.released.len())
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::NullDevice;
    use crate::sync::Fence;

    #[test]
    fn test_busy_allocator_is_not_reused() {
        let device = Arc::new(NullDevice::deferred());
        let queue = device.create_queue(QueueType::Direct).unwrap();
        let fence = Arc::new(Fence::new(Arc::clone(&device) as Arc<dyn NativeDevice>, "alloc").unwrap());
        let mut pool = CommandAllocatorPool::new(Arc::clone(&device) as Arc<dyn NativeDevice>, QueueType::Direct);

        let first = pool.obtain().unwrap();
        let first_raw = first.raw();
        let value = fence.signal(queue).unwrap();
        pool.release(first, Some(SyncPoint::new(Arc::clone(&fence), value)));

        let second = pool.obtain().unwrap();
        assert_ne!(second.raw(), first_raw);
        assert_eq!(pool.created(), 2);
        assert_eq!(device.stats().command_allocator_resets, 0);

        device.complete_all();
        let third = pool.obtain().unwrap();
        assert_eq!(third.raw(), first_raw);
        assert!(third.last_use().is_none());
        assert_eq!(device.stats().command_allocator_resets, 1);
    }

    #[test]
    fn test_allocator_without_sync_point_is_idle() {
        let device = Arc::new(NullDevice::new());
        let mut pool = CommandAllocatorPool::new(device, QueueType::Copy);

        let allocator = pool.obtain().unwrap();
        let raw = allocator.raw();
        pool.release(allocator, None);

        assert_eq!(pool.obtain().unwrap().raw(), raw);
        assert_eq!(pool.available(), 0);
    }
}
