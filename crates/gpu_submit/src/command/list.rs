//! Recording command lists

use std::fmt;
use std::sync::Arc;

use super::CommandAllocator;
use crate::error::GpuResult;
use crate::hal::{
    DescriptorTableKind, GpuDescriptorHandle, NativeDevice, QueueType, RawCommandList, RawDescriptorHeap,
    RecordedOp, ResourceBarrier, ShaderStage,
};
use crate::state::{ListStateTracker, Resource, ResourceStates, Subresources, TrackedState};
use crate::sync::{CompletionToken, SyncPoint};

/// A command list and everything attached to one recording of it
///
/// Exactly one of open (recording) or closed. Owned by the recording thread
/// until it is handed to [`CommandQueue::execute`](super::CommandQueue::execute).
pub struct CommandList {
    device: Arc<dyn NativeDevice>,
    raw: RawCommandList,
    queue_type: QueueType,
    generation: u64,
    open: bool,
    allocator: Option<CommandAllocator>,
    tracker: ListStateTracker,
    completion: CompletionToken,
    sync_point: Option<SyncPoint>,
    bound_heaps: Option<(RawDescriptorHeap, RawDescriptorHeap)>,
}

impl CommandList {
    pub(crate) fn create(
        device: Arc<dyn NativeDevice>,
        queue_type: QueueType,
        allocator: CommandAllocator,
    ) -> GpuResult<Self> {
        let raw = device.create_command_list(queue_type, allocator.raw())?;
        Ok(Self {
            device,
            raw,
            queue_type,
            generation: 0,
            open: true,
            allocator: Some(allocator),
            tracker: ListStateTracker::new(),
            completion: CompletionToken::new(),
            sync_point: None,
            bound_heaps: None,
        })
    }

    /// Re-open a recycled list against a fresh allocator
    pub(crate) fn reset(&mut self, allocator: CommandAllocator) -> GpuResult<()> {
        assert!(!self.open, "command list {:?} reset while recording", self.raw);
        self.device.reset_command_list(self.raw, allocator.raw())?;
        self.allocator = Some(allocator);
        self.open = true;
        self.generation += 1;
        self.tracker.clear();
        self.completion = CompletionToken::new();
        self.sync_point = None;
        self.bound_heaps = None;
        Ok(())
    }

    /// Native handle
    pub const fn raw(&self) -> RawCommandList {
        self.raw
    }

    /// Queue family the list records for
    pub const fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Number of times the list has been recycled
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the list is recording
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Sync point of the list's last submission
    pub const fn sync_point(&self) -> Option<&SyncPoint> {
        self.sync_point.as_ref()
    }

    /// Whether the GPU is done with the list's last submission
    ///
    /// A list that was discarded instead of submitted counts as idle.
    pub fn is_idle(&self) -> bool {
        !self.open && self.sync_point.as_ref().map_or(true, SyncPoint::is_complete)
    }

    /// Completion handle for the current recording
    pub fn completion_token(&self) -> &CompletionToken {
        &self.completion
    }

    /// Resource state tracker of the current recording
    pub const fn tracker(&self) -> &ListStateTracker {
        &self.tracker
    }

    /// This list's view of one subresource
    pub fn tracked_state(&self, resource: &Resource, index: u32) -> TrackedState {
        self.tracker.state(resource, index)
    }

    /// Close the list so it can be executed
    pub fn close(&mut self) -> GpuResult<()> {
        assert!(self.open, "command list {:?} closed twice", self.raw);
        self.device.close_command_list(self.raw)?;
        self.open = false;
        Ok(())
    }

    /// Move a resource into `target`, recording barriers where the list
    /// already knows the current state
    pub fn transition_resource(&mut self, resource: &Arc<Resource>, target: ResourceStates, subresources: Subresources) {
        self.ensure_open();
        let barriers = self.tracker.transition(resource, target, subresources);
        self.resource_barriers(barriers);
    }

    /// Record explicit barriers, bypassing the tracker
    pub fn resource_barriers(&mut self, barriers: Vec<ResourceBarrier>) {
        if !barriers.is_empty() {
            self.record(RecordedOp::ResourceBarriers(barriers));
        }
    }

    /// Record a non-indexed draw
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.record(RecordedOp::Draw {
            vertex_count,
            instance_count,
        });
    }

    /// Record a compute dispatch
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(RecordedOp::Dispatch { x, y, z });
    }

    /// Record a whole-resource copy, transitioning both sides first
    pub fn copy_resource(&mut self, dst: &Arc<Resource>, src: &Arc<Resource>) {
        self.transition_resource(dst, ResourceStates::COPY_DEST, Subresources::All);
        self.transition_resource(src, ResourceStates::COPY_SOURCE, Subresources::All);
        self.record(RecordedOp::CopyResource {
            dst: dst.raw(),
            src: src.raw(),
        });
    }

    /// Bind the online heap pair unless it is already bound
    pub(crate) fn set_descriptor_heaps(&mut self, view: RawDescriptorHeap, sampler: RawDescriptorHeap) {
        if self.bound_heaps == Some((view, sampler)) {
            return;
        }
        self.bound_heaps = Some((view, sampler));
        self.record(RecordedOp::SetDescriptorHeaps { view, sampler });
    }

    pub(crate) fn set_descriptor_table(&mut self, stage: ShaderStage, kind: DescriptorTableKind, base: GpuDescriptorHandle) {
        self.record(RecordedOp::SetDescriptorTable { stage, kind, base });
    }

    pub(crate) fn record(&mut self, op: RecordedOp) {
        self.ensure_open();
        self.device.record(self.raw, op);
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut ListStateTracker {
        &mut self.tracker
    }

    pub(crate) fn take_allocator(&mut self) -> Option<CommandAllocator> {
        self.allocator.take()
    }

    pub(crate) fn mark_submitted(&mut self, sync_point: SyncPoint) {
        self.completion.submit(sync_point.clone());
        self.sync_point = Some(sync_point);
    }

    pub(crate) fn mark_discarded(&mut self) {
        self.completion.discard();
        self.sync_point = None;
    }

    fn ensure_open(&self) {
        assert!(self.open, "command list {:?} recorded while closed", self.raw);
    }
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("raw", &self.raw)
            .field("queue_type", &self.queue_type)
            .field("generation", &self.generation)
            .field("open", &self.open)
            .field("sync_point", &self.sync_point)
            .finish_non_exhaustive()
    }
}
