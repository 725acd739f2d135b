//! Pool of reusable command lists

use std::collections::VecDeque;
use std::sync::Arc;

use super::{CommandAllocator, CommandList};
use crate::error::{configuration_exhausted, GpuResult};
use crate::hal::{NativeDevice, QueueType};

/// Command lists of one queue type
///
/// Lists come back in submission order, so only the front of the queue has to
/// be checked for completion.
#[derive(Debug)]
pub struct CommandListPool {
    queue_type: QueueType,
    max_command_lists: usize,
    live: usize,
    ready: VecDeque<CommandList>,
}

impl CommandListPool {
    /// Create an empty pool holding at most `max_command_lists` live lists
    pub fn new(queue_type: QueueType, max_command_lists: usize) -> Self {
        Self {
            queue_type,
            max_command_lists,
            live: 0,
            ready: VecDeque::new(),
        }
    }

    /// Take an open list recording into `allocator`
    ///
    /// Reuses the oldest recycled list once its last submission completed,
    /// otherwise creates one. Never waits on the GPU.
    ///
    /// # Panics
    ///
    /// When creating a list would exceed the configured hard cap.
    pub fn obtain(&mut self, device: &Arc<dyn NativeDevice>, allocator: CommandAllocator) -> GpuResult<CommandList> {
        if self.ready.front().is_some_and(CommandList::is_idle) {
            if let Some(mut list) = self.ready.pop_front() {
                if let Err(error) = list.reset(allocator) {
                    self.live -= 1;
                    return Err(error);
                }
                log::trace!("Reusing {} command list {:?} (generation {})", self.queue_type, list.raw(), list.generation());
                return Ok(list);
            }
        }

        if self.live >= self.max_command_lists {
            configuration_exhausted("live command lists", self.max_command_lists);
        }

        let list = CommandList::create(Arc::clone(device), self.queue_type, allocator)?;
        self.live += 1;
        log::debug!(
            "Created {} command list {:?} ({} live)",
            self.queue_type,
            list.raw(),
            self.live
        );
        Ok(list)
    }

    /// Return a closed list; it is reused once idle
    pub fn recycle(&mut self, list: CommandList) {
        assert!(!list.is_open(), "command list {:?} recycled while recording", list.raw());
        self.ready.push_back(list);
    }

    /// Lists created and not dropped
    pub const fn live(&self) -> usize {
        self.live
    }

    /// Lists waiting in the pool
    pub fn available(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandAllocatorPool;
    use crate::hal::NullDevice;

    fn device() -> (Arc<dyn NativeDevice>, CommandAllocatorPool) {
        let device: Arc<dyn NativeDevice> = Arc::new(NullDevice::new());
        let allocators = CommandAllocatorPool::new(Arc::clone(&device), QueueType::Direct);
        (device, allocators)
    }

    #[test]
    fn test_recycled_list_is_reused_with_new_generation() {
        let (device, mut allocators) = device();
        let mut pool = CommandListPool::new(QueueType::Direct, 4);

        let mut list = pool.obtain(&device, allocators.obtain().unwrap()).unwrap();
        let raw = list.raw();
        let first_token = list.completion_token().clone();
        list.close().unwrap();
        list.mark_discarded();
        if let Some(allocator) = list.take_allocator() {
            allocators.release(allocator, None);
        }
        pool.recycle(list);

        let reused = pool.obtain(&device, allocators.obtain().unwrap()).unwrap();
        assert_eq!(reused.raw(), raw);
        assert_eq!(reused.generation(), 1);
        assert!(reused.is_open());
        assert!(!reused.completion_token().same_recording(&first_token));
        assert_eq!(pool.live(), 1);
    }

    #[test]
    fn test_open_lists_force_creation() {
        let (device, mut allocators) = device();
        let mut pool = CommandListPool::new(QueueType::Direct, 4);

        let first = pool.obtain(&device, allocators.obtain().unwrap()).unwrap();
        let second = pool.obtain(&device, allocators.obtain().unwrap()).unwrap();
        assert_ne!(first.raw(), second.raw());
        assert_eq!(pool.live(), 2);
    }

    #[test]
    #[should_panic(expected = "configuration exhausted")]
    fn test_exceeding_cap_is_fatal() {
        let (device, mut allocators) = device();
        let mut pool = CommandListPool::new(QueueType::Direct, 1);

        let _held = pool.obtain(&device, allocators.obtain().unwrap()).unwrap();
        let _ = pool.obtain(&device, allocators.obtain().unwrap());
    }
}
