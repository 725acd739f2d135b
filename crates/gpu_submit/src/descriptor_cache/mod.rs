//! Descriptor caching and binding
//!
//! Each recording context stages its per-stage bindings in CPU-only tables and
//! copies them into online heap ranges when a table is bound. Tables whose
//! contents are identified by a [`TableKey`] are remembered in a
//! [`TableCache`] so identical binds skip the copies.

mod cache;
mod key;
mod stage;

pub use cache::{CacheStats, DescriptorCache, ViewHeapStrategy};
pub use key::{SamplerTableKey, SrvTableKey, TableCache, TableKey, MAX_SAMPLER_SLOTS, MAX_SHADER_RESOURCE_SLOTS};
pub use stage::{MAX_CONSTANT_BUFFER_SLOTS, MAX_UNORDERED_ACCESS_SLOTS};
