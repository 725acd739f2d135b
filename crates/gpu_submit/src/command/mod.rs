//! Command recording and submission
//!
//! Command lists and their allocators are pooled per queue type and only ever
//! reused once the fence value of their last submission has been reached.
//! Obtaining a list never blocks: when nothing in a pool is idle, a new object
//! is created.

mod allocator;
mod list;
mod pool;
mod queue;

pub use allocator::{CommandAllocator, CommandAllocatorPool};
pub use list::CommandList;
pub use pool::CommandListPool;
pub use queue::CommandQueue;
