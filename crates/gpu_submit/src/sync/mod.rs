//! GPU/CPU synchronization
//!
//! A [`Fence`] is the record of completion for one hardware queue. A
//! [`SyncPoint`] names one value on one fence and is what the rest of the crate
//! passes around to test or wait for completion. A [`CompletionToken`] is filled
//! in with a command list's sync point at submission so that descriptor heaps
//! the list referenced can tell when they may be recycled.

mod completion;
mod fence;

pub use completion::CompletionToken;
pub use fence::{Fence, SyncPoint};
