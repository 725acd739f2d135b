//! # GPU Submit
//!
//! Command submission and resource lifecycle core for an explicit graphics API.
//!
//! ## Features
//!
//! - **Command list pooling**: lists and allocators reused once their fence value is reached
//! - **Resource state tracking**: per-subresource states with barriers resolved at submission
//! - **Descriptor heaps**: thread-local, sub-allocated and global deduplicating online heaps
//! - **Descriptor caching**: identical descriptor tables bound without copies
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gpu_submit::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device: Arc<dyn NativeDevice> = Arc::new(NullDevice::new());
//!     let context = DeviceContext::new(device, DeviceConfig::default())?;
//!     let mut commands = context.create_command_context(QueueType::Direct)?;
//!
//!     let texture = context.create_resource(ResourceDesc::texture_2d(256, 256, 1, 1), ResourceStates::COMMON)?;
//!     let view = context.create_shader_resource_view(&texture)?;
//!
//!     commands.transition_resource(&texture, ResourceStates::PIXEL_SHADER_RESOURCE, Subresources::All)?;
//!     commands.set_shader_resources(ShaderStage::Pixel, 0, &[Some(view)]);
//!     commands.bind_shader_resources(ShaderStage::Pixel, 1)?;
//!     commands.draw(3, 1)?;
//!
//!     let sync_point = commands.close_and_submit(false)?;
//!     context.wait_for_sync_point(&sync_point)?;
//!     commands.end_frame();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod command;
pub mod config;
pub mod descriptor;
pub mod descriptor_cache;
pub mod error;
pub mod foundation;
pub mod hal;
pub mod state;
pub mod sync;

mod context;

#[cfg(test)]
mod tests;

pub use context::{CommandContext, DeviceContext};
pub use error::{DeviceError, GpuError, GpuResult};

/// Common imports for users of the crate
pub mod prelude {
    pub use crate::{
        command::{CommandList, CommandQueue},
        config::{Config, DeviceConfig},
        descriptor::{ConstantBufferView, SamplerState, ShaderResourceView, UnorderedAccessView},
        hal::{
            DescriptorHeapType, HeapKind, NativeDevice, NullDevice, QueueType, ResourceDesc, SamplerDesc, ShaderStage,
        },
        state::{Resource, ResourceStates, Subresource, SubresourceSubset, Subresources},
        sync::SyncPoint,
        CommandContext, DeviceContext, GpuError, GpuResult,
    };
}
