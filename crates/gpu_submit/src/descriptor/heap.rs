//! Descriptor heap storage and the online heap contract

use std::fmt;
use std::sync::Arc;

use crate::error::GpuResult;
use crate::hal::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapInfo, DescriptorHeapType, GpuDescriptorHandle,
    NativeDevice, RawDescriptorHeap,
};
use crate::sync::CompletionToken;

/// A native descriptor heap, destroyed on drop
pub struct DescriptorHeap {
    device: Arc<dyn NativeDevice>,
    desc: DescriptorHeapDesc,
    info: DescriptorHeapInfo,
}

impl DescriptorHeap {
    /// Create a heap of `capacity` descriptors
    pub fn new(
        device: Arc<dyn NativeDevice>,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> GpuResult<Self> {
        let desc = DescriptorHeapDesc {
            heap_type,
            capacity,
            shader_visible,
        };
        let info = device.create_descriptor_heap(&desc)?;
        log::debug!(
            "Created {} {} descriptor heap {:?} with {} slots",
            if shader_visible { "online" } else { "offline" },
            heap_type,
            info.raw,
            capacity
        );
        Ok(Self { device, desc, info })
    }

    /// Native handle
    pub const fn raw(&self) -> RawDescriptorHeap {
        self.info.raw
    }

    /// Heap family
    pub const fn heap_type(&self) -> DescriptorHeapType {
        self.desc.heap_type
    }

    /// Number of descriptors
    pub const fn capacity(&self) -> u32 {
        self.desc.capacity
    }

    /// Whether shaders can read from the heap
    pub const fn is_shader_visible(&self) -> bool {
        self.desc.shader_visible
    }

    /// Byte stride between descriptors
    pub const fn increment(&self) -> u32 {
        self.info.increment
    }

    /// CPU address of `slot`
    pub fn cpu_handle(&self, slot: u32) -> CpuDescriptorHandle {
        assert!(slot < self.desc.capacity, "slot {slot} outside heap {:?}", self.info.raw);
        self.info.cpu_start.offset(slot, self.info.increment)
    }

    /// GPU address of `slot`
    ///
    /// # Panics
    ///
    /// If the heap is not shader visible.
    pub fn gpu_handle(&self, slot: u32) -> GpuDescriptorHandle {
        assert!(slot < self.desc.capacity, "slot {slot} outside heap {:?}", self.info.raw);
        match self.info.gpu_start {
            Some(start) => start.offset(slot, self.info.increment),
            None => panic!("GPU handle requested from CPU-only heap {:?}", self.info.raw),
        }
    }

    /// Device the heap was created on
    pub fn device(&self) -> &Arc<dyn NativeDevice> {
        &self.device
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        log::trace!("Destroying descriptor heap {:?}", self.info.raw);
        self.device.destroy_descriptor_heap(self.info.raw);
    }
}

impl fmt::Debug for DescriptorHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeap")
            .field("raw", &self.info.raw)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// What [`OnlineDescriptorHeap::roll_over`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollOverOutcome {
    /// A different backing heap is now active and must be re-bound
    RolledOver,
    /// The same backing heap is active with recycled slots
    LoopedAround,
    /// Nothing could be recycled; the caller must fall back
    Exhausted,
}

/// Shader-visible descriptor storage handed out in contiguous ranges
///
/// Slots returned by [`Self::reserve`] are relative to the current backing range
/// and stay valid until the next successful [`Self::roll_over`].
pub trait OnlineDescriptorHeap {
    /// Heap family
    fn heap_type(&self) -> DescriptorHeapType;

    /// Native handle of the active backing heap
    fn raw(&self) -> RawDescriptorHeap;

    /// Slots available in one backing range
    fn capacity(&self) -> u32;

    /// Next free slot
    fn cursor(&self) -> u32;

    /// Whether `count` contiguous slots are free
    fn can_reserve(&self, count: u32) -> bool {
        self.cursor().checked_add(count).is_some_and(|end| end <= self.capacity())
    }

    /// Reserve `count` contiguous slots, returning the first
    ///
    /// # Panics
    ///
    /// If [`Self::can_reserve`] is false.
    fn reserve(&mut self, count: u32) -> u32;

    /// Make room once the active range is full
    ///
    /// Slots are only recycled after every command list that referenced them
    /// has completed.
    fn roll_over(&mut self) -> GpuResult<RollOverOutcome>;

    /// Record that a command list references the active range
    fn notify_command_list(&mut self, token: &CompletionToken);

    /// CPU address of `slot`
    fn cpu_handle(&self, slot: u32) -> CpuDescriptorHandle;

    /// GPU address of `slot`
    fn gpu_handle(&self, slot: u32) -> GpuDescriptorHandle;
}

/// Command lists referencing one backing range
#[derive(Debug, Default)]
pub(crate) struct HeapUsers {
    tokens: Vec<CompletionToken>,
}

impl HeapUsers {
    /// Prune threshold for long-lived ranges referenced by many lists
    const PRUNE_THRESHOLD: usize = 64;

    pub(crate) fn add(&mut self, token: &CompletionToken) {
        if self.tokens.last().is_some_and(|last| last.same_recording(token)) {
            return;
        }
        if self.tokens.len() >= Self::PRUNE_THRESHOLD {
            self.tokens.retain(|t| !t.is_complete());
        }
        self.tokens.push(token.clone());
    }

    pub(crate) fn all_complete(&self) -> bool {
        self.tokens.iter().all(CompletionToken::is_complete)
    }

    pub(crate) fn clear(&mut self) {
        self.tokens.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }
}
