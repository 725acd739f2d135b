//! Descriptor heap allocation
//!
//! Online (shader-visible) heaps come in three strategies behind the
//! [`OnlineDescriptorHeap`] trait:
//!
//! - [`ThreadLocalHeap`]: one active heap per context plus a reclaim pool.
//! - [`SubAllocatedHeap`]: fixed blocks of a device-wide view heap.
//! - [`GlobalSamplerHeap`]: deduplicated sampler tables shared by all contexts.
//!
//! Offline (CPU-only) heaps hold the source descriptors of views and samplers
//! and are managed by [`OfflineDescriptorManager`].

mod global_sampler;
mod heap;
mod offline;
mod sub_allocated;
mod thread_local;
mod views;

pub use global_sampler::{GlobalSamplerHeap, GlobalSamplerTables, SamplerTableMap};
pub use heap::{DescriptorHeap, OnlineDescriptorHeap, RollOverOutcome};
pub use offline::{OfflineDescriptor, OfflineDescriptorManager};
pub use sub_allocated::{SubAllocatedHeap, SubAllocatedHeapPool};
pub use thread_local::ThreadLocalHeap;
pub use views::{ConstantBufferView, SamplerState, ShaderResourceView, UnorderedAccessView};
