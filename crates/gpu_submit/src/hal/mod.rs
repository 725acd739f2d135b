//! Native device abstraction
//!
//! The submission core needs only a handful of primitives from the underlying
//! graphics API: object creation, fence signal and completion queries, batch
//! execution, and descriptor creation/copies. Backends implement
//! [`NativeDevice`]. Objects are referred to by plain copyable handles that the
//! RAII wrappers in this crate own and release.
//!
//! [`NullDevice`] is an in-process software backend that executes batches
//! instantly or on demand; the test-suite runs against it.

use std::fmt;
use std::sync::Arc;

use crate::error::DeviceError;
use crate::state::{ResourceStates, Subresource};

pub mod event;
pub mod null;

pub use event::Event;
pub use null::{NullDevice, NullDeviceStats};

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// The null handle
            pub const fn null() -> Self {
                Self(0)
            }

            /// Whether this is the null handle
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

define_handle!(
    /// Hardware queue handle
    RawQueue
);
define_handle!(
    /// Command allocator handle
    RawCommandAllocator
);
define_handle!(
    /// Command list handle
    RawCommandList
);
define_handle!(
    /// Fence handle
    RawFence
);
define_handle!(
    /// Descriptor heap handle
    RawDescriptorHeap
);
define_handle!(
    /// GPU resource handle
    RawResource
);

/// Hardware queue families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Graphics + compute + copy
    Direct,
    /// Compute + copy
    Compute,
    /// Copy only
    Copy,
}

impl QueueType {
    /// Every queue type, in index order
    pub const ALL: [Self; 3] = [Self::Direct, Self::Compute, Self::Copy];

    /// Dense index for per-queue arrays
    pub const fn index(self) -> usize {
        match self {
            Self::Direct => 0,
            Self::Compute => 1,
            Self::Copy => 2,
        }
    }

    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Compute => "compute",
            Self::Copy => "copy",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Descriptor heap families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Constant buffer, shader resource and unordered access views
    View,
    /// Samplers
    Sampler,
}

impl DescriptorHeapType {
    /// Every heap type, in index order
    pub const ALL: [Self; 2] = [Self::View, Self::Sampler];

    /// Dense index for per-type arrays
    pub const fn index(self) -> usize {
        match self {
            Self::View => 0,
            Self::Sampler => 1,
        }
    }

    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Sampler => "sampler",
        }
    }
}

impl fmt::Display for DescriptorHeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters for creating a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    /// Heap family
    pub heap_type: DescriptorHeapType,
    /// Number of descriptors
    pub capacity: u32,
    /// Whether shaders can read from the heap (online) or it is CPU-only (offline)
    pub shader_visible: bool,
}

/// CPU address of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    /// Handle `slots` descriptors further along the same heap
    pub const fn offset(self, slots: u32, increment: u32) -> Self {
        Self(self.0 + slots as u64 * increment as u64)
    }
}

/// GPU address of a descriptor in a shader-visible heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    /// Handle `slots` descriptors further along the same heap
    pub const fn offset(self, slots: u32, increment: u32) -> Self {
        Self(self.0 + slots as u64 * increment as u64)
    }
}

/// Result of creating a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    /// Heap handle
    pub raw: RawDescriptorHeap,
    /// CPU address of slot 0
    pub cpu_start: CpuDescriptorHandle,
    /// GPU address of slot 0, only for shader-visible heaps
    pub gpu_start: Option<GpuDescriptorHandle>,
    /// Byte stride between consecutive descriptors
    pub increment: u32,
}

/// Memory heap a resource lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Device local memory
    Default,
    /// Persistently mapped CPU-to-GPU memory
    Upload,
    /// GPU-to-CPU memory
    Readback,
}

/// Resource dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    /// Linear buffer
    Buffer,
    /// 1D texture
    Texture1D,
    /// 2D texture
    Texture2D,
    /// 3D texture
    Texture3D,
}

/// Description of a GPU resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Dimensionality
    pub dimension: ResourceDimension,
    /// Width in texels, or size in bytes for buffers
    pub width: u64,
    /// Height in texels
    pub height: u32,
    /// Mip level count
    pub mip_levels: u16,
    /// Array slice count (depth for 3D textures)
    pub array_size: u16,
    /// Format plane count (2 for depth-stencil formats)
    pub plane_count: u8,
    /// Memory heap
    pub heap: HeapKind,
}

impl ResourceDesc {
    /// Describe a buffer
    pub fn buffer(size: u64, heap: HeapKind) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            mip_levels: 1,
            array_size: 1,
            plane_count: 1,
            heap,
        }
    }

    /// Describe a device-local 2D texture
    pub fn texture_2d(width: u32, height: u32, mip_levels: u16, array_size: u16) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width: u64::from(width),
            height,
            mip_levels: mip_levels.max(1),
            array_size: array_size.max(1),
            plane_count: 1,
            heap: HeapKind::Default,
        }
    }

    /// Set the format plane count
    pub fn with_planes(mut self, plane_count: u8) -> Self {
        self.plane_count = plane_count.max(1);
        self
    }

    /// Number of individually addressable subresources
    pub fn subresource_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer => 1,
            ResourceDimension::Texture3D => u32::from(self.mip_levels) * u32::from(self.plane_count),
            _ => {
                u32::from(self.mip_levels) * u32::from(self.array_size) * u32::from(self.plane_count)
            }
        }
    }
}

/// Sampler filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    /// Nearest texel
    Point,
    /// Bilinear / trilinear
    Linear,
    /// Anisotropic
    Anisotropic,
}

/// Sampler addressing outside [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    /// Repeat
    Wrap,
    /// Clamp to edge
    Clamp,
    /// Mirrored repeat
    Mirror,
    /// Border colour
    Border,
}

/// Sampler description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    /// Filtering
    pub filter: FilterMode,
    /// Addressing applied to all three axes
    pub address_mode: AddressMode,
    /// Anisotropy clamp, only meaningful for [`FilterMode::Anisotropic`]
    pub max_anisotropy: u32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: FilterMode::Linear,
            address_mode: AddressMode::Wrap,
            max_anisotropy: 1,
        }
    }
}

/// Contents written into a descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDesc {
    /// Constant buffer view
    ConstantBuffer {
        /// Backing buffer
        resource: RawResource,
        /// Visible size in bytes
        size_in_bytes: u32,
    },
    /// Shader resource view
    ShaderResource {
        /// Viewed resource
        resource: RawResource,
    },
    /// Unordered access view
    UnorderedAccess {
        /// Viewed resource
        resource: RawResource,
    },
    /// Sampler
    Sampler(SamplerDesc),
    /// Null view of the given table kind; reads return zero
    Null(DescriptorTableKind),
}

/// Programmable pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader
    Vertex,
    /// Hull shader
    Hull,
    /// Domain shader
    Domain,
    /// Geometry shader
    Geometry,
    /// Pixel shader
    Pixel,
    /// Compute shader
    Compute,
}

impl ShaderStage {
    /// Number of stages
    pub const COUNT: usize = 6;

    /// Every stage, in index order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Vertex,
        Self::Hull,
        Self::Domain,
        Self::Geometry,
        Self::Pixel,
        Self::Compute,
    ];

    /// Dense index for per-stage arrays
    pub const fn index(self) -> usize {
        match self {
            Self::Vertex => 0,
            Self::Hull => 1,
            Self::Domain => 2,
            Self::Geometry => 3,
            Self::Pixel => 4,
            Self::Compute => 5,
        }
    }
}

/// Kinds of descriptor tables bound per stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorTableKind {
    /// Constant buffer views
    ConstantBuffers,
    /// Shader resource views
    ShaderResources,
    /// Samplers
    Samplers,
    /// Unordered access views
    UnorderedAccessViews,
}

impl DescriptorTableKind {
    /// Heap family the table lives in
    pub const fn heap_type(self) -> DescriptorHeapType {
        match self {
            Self::Samplers => DescriptorHeapType::Sampler,
            _ => DescriptorHeapType::View,
        }
    }
}

/// Transition of one resource (or one of its subresources) between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrier {
    /// Transitioned resource
    pub resource: RawResource,
    /// Affected subresource(s)
    pub subresource: Subresource,
    /// State before the barrier
    pub before: ResourceStates,
    /// State after the barrier
    pub after: ResourceStates,
}

/// Command recorded into a command list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    /// Resource transition barriers
    ResourceBarriers(Vec<ResourceBarrier>),
    /// Bind the online view and sampler heaps
    SetDescriptorHeaps {
        /// Online view heap
        view: RawDescriptorHeap,
        /// Online sampler heap
        sampler: RawDescriptorHeap,
    },
    /// Bind a descriptor table for one stage
    SetDescriptorTable {
        /// Consuming stage
        stage: ShaderStage,
        /// Table kind
        kind: DescriptorTableKind,
        /// First descriptor of the table
        base: GpuDescriptorHandle,
    },
    /// Non-indexed draw
    Draw {
        /// Vertices per instance
        vertex_count: u32,
        /// Instance count
        instance_count: u32,
    },
    /// Compute dispatch
    Dispatch {
        /// Thread groups along X
        x: u32,
        /// Thread groups along Y
        y: u32,
        /// Thread groups along Z
        z: u32,
    },
    /// Whole-resource copy
    CopyResource {
        /// Destination
        dst: RawResource,
        /// Source
        src: RawResource,
    },
}

/// Primitives consumed from the native graphics API
///
/// Implementations must be callable from any thread. The submission core
/// guarantees that a single command list is only touched by one thread at a
/// time and that `execute_command_lists` + `signal` on one queue are issued
/// under that queue's submission lock.
pub trait NativeDevice: Send + Sync {
    /// Create a hardware queue
    fn create_queue(&self, queue_type: QueueType) -> Result<RawQueue, DeviceError>;

    /// Create backing memory for command lists of `queue_type`
    fn create_command_allocator(&self, queue_type: QueueType) -> Result<RawCommandAllocator, DeviceError>;

    /// Reclaim all memory of an allocator; the GPU must be done with it
    fn reset_command_allocator(&self, allocator: RawCommandAllocator) -> Result<(), DeviceError>;

    /// Create a command list in the open (recording) state
    fn create_command_list(
        &self,
        queue_type: QueueType,
        allocator: RawCommandAllocator,
    ) -> Result<RawCommandList, DeviceError>;

    /// Re-open a closed command list against an allocator
    fn reset_command_list(&self, list: RawCommandList, allocator: RawCommandAllocator) -> Result<(), DeviceError>;

    /// Close a command list so it can be executed
    fn close_command_list(&self, list: RawCommandList) -> Result<(), DeviceError>;

    /// Record a command into an open list
    fn record(&self, list: RawCommandList, op: RecordedOp);

    /// Execute closed lists in array order
    fn execute_command_lists(&self, queue: RawQueue, lists: &[RawCommandList]) -> Result<(), DeviceError>;

    /// Create a fence with an initial completed value
    fn create_fence(&self, initial_value: u64) -> Result<RawFence, DeviceError>;

    /// Have `queue` set `fence` to `value` once prior work completes
    fn signal(&self, queue: RawQueue, fence: RawFence, value: u64) -> Result<(), DeviceError>;

    /// Last value the GPU has written to `fence`
    fn completed_value(&self, fence: RawFence) -> u64;

    /// Signal `event` once `fence` reaches `value`
    fn set_event_on_completion(&self, fence: RawFence, value: u64, event: &Arc<Event>) -> Result<(), DeviceError>;

    /// Create a descriptor heap
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo, DeviceError>;

    /// Release a descriptor heap
    fn destroy_descriptor_heap(&self, heap: RawDescriptorHeap);

    /// Byte stride between descriptors of `heap_type`
    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32;

    /// Write a descriptor into a CPU slot
    fn create_view(&self, dst: CpuDescriptorHandle, desc: &ViewDesc);

    /// Gather single descriptors from `src` into a contiguous range at `dst`
    fn copy_descriptors(&self, dst: CpuDescriptorHandle, src: &[CpuDescriptorHandle], heap_type: DescriptorHeapType);

    /// Copy a contiguous range of `count` descriptors
    fn copy_descriptors_simple(
        &self,
        count: u32,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        heap_type: DescriptorHeapType,
    );

    /// Create a committed resource
    fn create_resource(&self, desc: &ResourceDesc) -> Result<RawResource, DeviceError>;

    /// Whether the device has been removed or reset
    fn is_lost(&self) -> bool;
}
