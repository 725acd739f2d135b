//! Device-scoped state and per-thread recording contexts
//!
//! A [`DeviceContext`] owns everything that lives as long as the logical
//! device: the queues, the shared descriptor heaps, the offline descriptor
//! storage and the sampler registry. Recording threads each create a
//! [`CommandContext`] from it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::{CommandList, CommandQueue};
use crate::config::DeviceConfig;
use crate::descriptor::{
    ConstantBufferView, GlobalSamplerHeap, OfflineDescriptor, OfflineDescriptorManager, SamplerState,
    ShaderResourceView, SubAllocatedHeapPool, UnorderedAccessView,
};
use crate::descriptor_cache::DescriptorCache;
use crate::error::{GpuError, GpuResult};
use crate::hal::{
    CpuDescriptorHandle, DescriptorHeapType, DescriptorTableKind, NativeDevice, QueueType, ResourceDesc, SamplerDesc,
    ShaderStage, ViewDesc,
};
use crate::state::{Resource, ResourceStates, ScopedTransition, Subresource, Subresources};
use crate::sync::SyncPoint;

struct NullDescriptors {
    constant_buffer: OfflineDescriptor,
    shader_resource: OfflineDescriptor,
    unordered_access: OfflineDescriptor,
}

struct SamplerRegistry {
    by_desc: HashMap<SamplerDesc, SamplerState>,
    next_id: u32,
}

/// Everything shared by the recording contexts of one logical device
pub struct DeviceContext {
    device: Arc<dyn NativeDevice>,
    config: DeviceConfig,
    device_lost: Arc<AtomicBool>,
    queues: Vec<CommandQueue>,
    view_descriptors: Arc<OfflineDescriptorManager>,
    sampler_descriptors: Arc<OfflineDescriptorManager>,
    sub_allocation_pool: Arc<SubAllocatedHeapPool>,
    global_samplers: GlobalSamplerHeap,
    view_sequence: AtomicU64,
    samplers: Mutex<SamplerRegistry>,
    null_descriptors: NullDescriptors,
    default_sampler: SamplerState,
}

impl DeviceContext {
    /// Validate `config` and create the queues and shared heaps
    pub fn new(device: Arc<dyn NativeDevice>, config: DeviceConfig) -> GpuResult<Arc<Self>> {
        config.validate()?;
        let device_lost = Arc::new(AtomicBool::new(false));

        let queues = QueueType::ALL
            .iter()
            .map(|&queue_type| CommandQueue::new(Arc::clone(&device), queue_type, &config, Arc::clone(&device_lost)))
            .collect::<GpuResult<Vec<_>>>()?;

        let view_descriptors = Arc::new(OfflineDescriptorManager::new(
            Arc::clone(&device),
            DescriptorHeapType::View,
            config.offline_heap_capacity,
        ));
        let sampler_descriptors = Arc::new(OfflineDescriptorManager::new(
            Arc::clone(&device),
            DescriptorHeapType::Sampler,
            config.offline_heap_capacity,
        ));
        let sub_allocation_pool = Arc::new(SubAllocatedHeapPool::new(
            Arc::clone(&device),
            config.global_view_heap_capacity,
            config.sub_allocation_block_size,
        )?);
        let global_samplers = GlobalSamplerHeap::new(Arc::clone(&device), config.global_sampler_heap_capacity)?;

        let null_descriptors = NullDescriptors {
            constant_buffer: view_descriptors.allocate(&ViewDesc::Null(DescriptorTableKind::ConstantBuffers))?,
            shader_resource: view_descriptors.allocate(&ViewDesc::Null(DescriptorTableKind::ShaderResources))?,
            unordered_access: view_descriptors.allocate(&ViewDesc::Null(DescriptorTableKind::UnorderedAccessViews))?,
        };

        let default_desc = SamplerDesc::default();
        let default_sampler = SamplerState::new(
            SamplerState::DEFAULT_ID,
            default_desc,
            sampler_descriptors.allocate(&ViewDesc::Sampler(default_desc))?,
        );
        let mut by_desc = HashMap::new();
        by_desc.insert(default_desc, default_sampler.clone());

        log::info!(
            "Device context ready: {} view heap blocks of {}, {} global samplers",
            sub_allocation_pool.block_count(),
            sub_allocation_pool.block_size(),
            config.global_sampler_heap_capacity
        );

        Ok(Arc::new(Self {
            device,
            config,
            device_lost,
            queues,
            view_descriptors,
            sampler_descriptors,
            sub_allocation_pool,
            global_samplers,
            view_sequence: AtomicU64::new(1),
            samplers: Mutex::new(SamplerRegistry { by_desc, next_id: 1 }),
            null_descriptors,
            default_sampler,
        }))
    }

    /// Capacity configuration
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The queue of `queue_type`
    pub fn queue(&self, queue_type: QueueType) -> &CommandQueue {
        &self.queues[queue_type.index()]
    }

    /// Device-wide view heap carved into blocks
    pub fn sub_allocation_pool(&self) -> &Arc<SubAllocatedHeapPool> {
        &self.sub_allocation_pool
    }

    /// Device-wide deduplicating sampler heap
    pub const fn global_sampler_heap(&self) -> &GlobalSamplerHeap {
        &self.global_samplers
    }

    /// Whether the device has been lost
    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeDevice> {
        &self.device
    }

    pub(crate) fn null_descriptor(&self, kind: DescriptorTableKind) -> CpuDescriptorHandle {
        match kind {
            DescriptorTableKind::ConstantBuffers => self.null_descriptors.constant_buffer.handle(),
            DescriptorTableKind::ShaderResources => self.null_descriptors.shader_resource.handle(),
            DescriptorTableKind::UnorderedAccessViews => self.null_descriptors.unordered_access.handle(),
            DescriptorTableKind::Samplers => self.default_sampler.descriptor(),
        }
    }

    /// Create a committed resource whose authoritative state starts at `initial_state`
    pub fn create_resource(&self, desc: ResourceDesc, initial_state: ResourceStates) -> GpuResult<Arc<Resource>> {
        Ok(Resource::create(self.device.as_ref(), desc, initial_state)?)
    }

    /// Create a shader resource view of the whole resource
    pub fn create_shader_resource_view(&self, resource: &Arc<Resource>) -> GpuResult<ShaderResourceView> {
        let descriptor = self
            .view_descriptors
            .allocate(&ViewDesc::ShaderResource { resource: resource.raw() })?;
        Ok(ShaderResourceView::new(descriptor, Arc::clone(resource), self.next_view_sequence()))
    }

    /// Point `view` at a different resource
    ///
    /// The view gets a new sequence number, so cached tables containing it
    /// miss on their next bind.
    pub fn rename_shader_resource_view(&self, view: &ShaderResourceView, resource: Arc<Resource>) {
        view.rename(resource, self.next_view_sequence());
    }

    /// Create a constant buffer view of the first `size_in_bytes` of `buffer`
    pub fn create_constant_buffer_view(&self, buffer: &Arc<Resource>, size_in_bytes: u32) -> GpuResult<ConstantBufferView> {
        let descriptor = self.view_descriptors.allocate(&ViewDesc::ConstantBuffer {
            resource: buffer.raw(),
            size_in_bytes,
        })?;
        Ok(ConstantBufferView::new(descriptor, Arc::clone(buffer)))
    }

    /// Create an unordered access view of the whole resource
    pub fn create_unordered_access_view(&self, resource: &Arc<Resource>) -> GpuResult<UnorderedAccessView> {
        let descriptor = self
            .view_descriptors
            .allocate(&ViewDesc::UnorderedAccess { resource: resource.raw() })?;
        Ok(UnorderedAccessView::new(descriptor, Arc::clone(resource)))
    }

    /// Sampler for `desc`; identical descriptions return the same sampler
    pub fn create_sampler(&self, desc: SamplerDesc) -> GpuResult<SamplerState> {
        let mut registry = self.samplers.lock();
        if let Some(existing) = registry.by_desc.get(&desc) {
            return Ok(existing.clone());
        }
        let id = registry.next_id;
        let sampler = SamplerState::new(id, desc, self.sampler_descriptors.allocate(&ViewDesc::Sampler(desc))?);
        registry.next_id += 1;
        registry.by_desc.insert(desc, sampler.clone());
        log::debug!("Registered sampler {} for {:?}", id, desc);
        Ok(sampler)
    }

    /// Sampler bound to empty sampler slots
    pub const fn default_sampler(&self) -> &SamplerState {
        &self.default_sampler
    }

    /// Create a recording context for `queue_type`
    pub fn create_command_context(self: &Arc<Self>, queue_type: QueueType) -> GpuResult<CommandContext> {
        CommandContext::new(Arc::clone(self), queue_type)
    }

    /// Block until `sync_point` has been reached
    pub fn wait_for_sync_point(&self, sync_point: &SyncPoint) -> GpuResult<()> {
        if self.is_device_lost() {
            return Err(GpuError::DeviceLost);
        }
        sync_point.wait().map_err(|error| self.observe(error))
    }

    /// Whether `sync_point` has been reached
    pub fn is_sync_point_complete(&self, sync_point: &SyncPoint) -> bool {
        sync_point.is_complete()
    }

    /// Block until every queue has drained
    pub fn wait_for_idle(&self) -> GpuResult<()> {
        for queue in &self.queues {
            queue.wait_for_idle()?;
        }
        Ok(())
    }

    fn next_view_sequence(&self) -> u64 {
        self.view_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn observe(&self, error: GpuError) -> GpuError {
        if matches!(error, GpuError::DeviceLost) && !self.device_lost.swap(true, Ordering::AcqRel) {
            log::error!("Device lost while waiting; further submissions are disabled");
        }
        error
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("config", &self.config)
            .field("device_lost", &self.is_device_lost())
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

/// One recording thread's view of a queue
///
/// Holds at most one open command list, acquired lazily, plus the descriptor
/// cache its bindings go through. Copy queue contexts have no descriptor cache.
pub struct CommandContext {
    device: Arc<DeviceContext>,
    queue_type: QueueType,
    list: Option<CommandList>,
    descriptors: Option<DescriptorCache>,
    last_sync_point: Option<SyncPoint>,
}

impl CommandContext {
    fn new(device: Arc<DeviceContext>, queue_type: QueueType) -> GpuResult<Self> {
        let descriptors = match queue_type {
            QueueType::Copy => None,
            QueueType::Direct | QueueType::Compute => Some(DescriptorCache::new(Arc::clone(&device))?),
        };
        Ok(Self {
            device,
            queue_type,
            list: None,
            descriptors,
            last_sync_point: None,
        })
    }

    /// Queue family the context records for
    pub const fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Device the context belongs to
    pub const fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Sync point of the last submission from this context
    pub const fn last_sync_point(&self) -> Option<&SyncPoint> {
        self.last_sync_point.as_ref()
    }

    /// The open command list, if one has been acquired
    pub const fn command_list(&self) -> Option<&CommandList> {
        self.list.as_ref()
    }

    /// Descriptor cache; `None` on copy queues
    pub const fn descriptor_cache(&self) -> Option<&DescriptorCache> {
        self.descriptors.as_ref()
    }

    /// The open command list, obtaining one from the queue if needed
    pub fn acquire_command_list(&mut self) -> GpuResult<&mut CommandList> {
        open_list(&mut self.list, &mut self.descriptors, self.device.queue(self.queue_type))
    }

    /// Close the open list and submit it on its own
    ///
    /// With `wait_for_completion` the call returns only once the GPU has
    /// executed it.
    pub fn close_and_submit(&mut self, wait_for_completion: bool) -> GpuResult<SyncPoint> {
        let list = self.take_closed_list()?.ok_or_else(|| GpuError::InvalidOperation {
            reason: "no command list to submit".to_string(),
        })?;
        let sync_point = self.device.queue(self.queue_type).execute(vec![list], wait_for_completion)?;
        self.last_sync_point = Some(sync_point.clone());
        Ok(sync_point)
    }

    /// Close the open list and hand it over for batched submission
    pub fn take_closed_list(&mut self) -> GpuResult<Option<CommandList>> {
        match self.list.take() {
            Some(mut list) => {
                list.close()?;
                Ok(Some(list))
            }
            None => Ok(None),
        }
    }

    /// Throw away the open list without submitting it
    pub fn discard(&mut self) -> GpuResult<()> {
        match self.list.take() {
            Some(list) => self.device.queue(self.queue_type).discard(list),
            None => Ok(()),
        }
    }

    /// Transition `subresources` of `resource` to `target` on the open list
    pub fn transition_resource(
        &mut self,
        resource: &Arc<Resource>,
        target: ResourceStates,
        subresources: Subresources,
    ) -> GpuResult<()> {
        self.acquire_command_list()?
            .transition_resource(resource, target, subresources);
        Ok(())
    }

    /// Transition until the returned guard is dropped
    pub fn scoped_transition(
        &mut self,
        resource: &Arc<Resource>,
        subresource: Subresource,
        after: ResourceStates,
    ) -> GpuResult<ScopedTransition<'_>> {
        let list = self.acquire_command_list()?;
        Ok(ScopedTransition::new(list, resource, subresource, after))
    }

    /// Reserve `count` online descriptors of `heap_type`, returning the first slot
    pub fn reserve_descriptors(&mut self, heap_type: DescriptorHeapType, count: u32) -> GpuResult<u32> {
        let list = open_list(&mut self.list, &mut self.descriptors, self.device.queue(self.queue_type))?;
        descriptor_cache(&mut self.descriptors).reserve_descriptors(list, heap_type, count)
    }

    /// Set constant buffer slots `start..` of `stage`
    pub fn set_constant_buffers(&mut self, stage: ShaderStage, start: usize, views: &[Option<ConstantBufferView>]) {
        descriptor_cache(&mut self.descriptors).set_constant_buffers(stage, start, views);
    }

    /// Set shader resource slots `start..` of `stage`
    pub fn set_shader_resources(&mut self, stage: ShaderStage, start: usize, views: &[Option<ShaderResourceView>]) {
        descriptor_cache(&mut self.descriptors).set_shader_resources(stage, start, views);
    }

    /// Set sampler slots `start..` of `stage`
    pub fn set_samplers(&mut self, stage: ShaderStage, start: usize, samplers: &[Option<SamplerState>]) {
        descriptor_cache(&mut self.descriptors).set_samplers(stage, start, samplers);
    }

    /// Set unordered access slots `start..` of `stage`
    pub fn set_unordered_access_views(&mut self, stage: ShaderStage, start: usize, views: &[Option<UnorderedAccessView>]) {
        descriptor_cache(&mut self.descriptors).set_unordered_access_views(stage, start, views);
    }

    /// Bind the first `slots_needed` constant buffers of `stage`
    pub fn bind_constant_buffers(&mut self, stage: ShaderStage, slots_needed: usize) -> GpuResult<()> {
        let list = open_list(&mut self.list, &mut self.descriptors, self.device.queue(self.queue_type))?;
        descriptor_cache(&mut self.descriptors).bind_constant_buffers(list, stage, slots_needed)
    }

    /// Bind the first `slots_needed` shader resource views of `stage`
    pub fn bind_shader_resources(&mut self, stage: ShaderStage, slots_needed: usize) -> GpuResult<()> {
        let list = open_list(&mut self.list, &mut self.descriptors, self.device.queue(self.queue_type))?;
        descriptor_cache(&mut self.descriptors).bind_shader_resources(list, stage, slots_needed)
    }

    /// Bind the first `slots_needed` samplers of `stage`
    pub fn bind_samplers(&mut self, stage: ShaderStage, slots_needed: usize) -> GpuResult<()> {
        let list = open_list(&mut self.list, &mut self.descriptors, self.device.queue(self.queue_type))?;
        descriptor_cache(&mut self.descriptors).bind_samplers(list, stage, slots_needed)
    }

    /// Bind the first `slots_needed` unordered access views of `stage`
    pub fn bind_unordered_access_views(&mut self, stage: ShaderStage, slots_needed: usize) -> GpuResult<()> {
        let list = open_list(&mut self.list, &mut self.descriptors, self.device.queue(self.queue_type))?;
        descriptor_cache(&mut self.descriptors).bind_unordered_access_views(list, stage, slots_needed)
    }

    /// Record a draw on the open list
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> GpuResult<()> {
        self.acquire_command_list()?.draw(vertex_count, instance_count);
        Ok(())
    }

    /// Record a dispatch on the open list
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> GpuResult<()> {
        self.acquire_command_list()?.dispatch(x, y, z);
        Ok(())
    }

    /// Merge this frame's sampler tables into the device's global heap
    pub fn end_frame(&mut self) -> usize {
        self.descriptors.as_mut().map_or(0, DescriptorCache::end_frame)
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        if let Some(list) = self.list.take() {
            if let Err(error) = self.device.queue(self.queue_type).discard(list) {
                log::warn!("Failed to discard open {} command list: {}", self.queue_type, error);
            }
        }
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("queue_type", &self.queue_type)
            .field("list", &self.list)
            .field("descriptors", &self.descriptors)
            .field("last_sync_point", &self.last_sync_point)
            .finish_non_exhaustive()
    }
}

fn open_list<'a>(
    slot: &'a mut Option<CommandList>,
    descriptors: &mut Option<DescriptorCache>,
    queue: &CommandQueue,
) -> GpuResult<&'a mut CommandList> {
    let list = match slot.take() {
        Some(list) => list,
        None => {
            if let Some(cache) = descriptors.as_mut() {
                cache.begin_command_list();
            }
            queue.obtain_command_list()?
        }
    };
    Ok(slot.insert(list))
}

fn descriptor_cache(descriptors: &mut Option<DescriptorCache>) -> &mut DescriptorCache {
    match descriptors {
        Some(cache) => cache,
        None => panic!("copy queue contexts have no descriptor bindings"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{AddressMode, FilterMode, NullDevice, RawResource};

    fn setup() -> (Arc<NullDevice>, Arc<DeviceContext>) {
        let device = Arc::new(NullDevice::new());
        let context = DeviceContext::new(Arc::clone(&device) as Arc<dyn NativeDevice>, DeviceConfig::default()).unwrap();
        (device, context)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let device: Arc<dyn NativeDevice> = Arc::new(NullDevice::new());
        let config = DeviceConfig::new().with_max_command_lists(0);
        assert!(matches!(DeviceContext::new(device, config), Err(GpuError::Config(_))));
    }

    #[test]
    fn test_identical_samplers_share_an_id() {
        let (_device, context) = setup();
        let desc = SamplerDesc {
            filter: FilterMode::Anisotropic,
            address_mode: AddressMode::Mirror,
            max_anisotropy: 8,
        };
        let first = context.create_sampler(desc).unwrap();
        let second = context.create_sampler(desc).unwrap();
        assert_eq!(first.id(), second.id());
        assert_ne!(first.id(), SamplerState::DEFAULT_ID);
        assert_eq!(context.create_sampler(SamplerDesc::default()).unwrap().id(), SamplerState::DEFAULT_ID);
    }

    #[test]
    fn test_rename_changes_sequence_and_descriptor() {
        let (device, context) = setup();
        let first = context
            .create_resource(ResourceDesc::texture_2d(4, 4, 1, 1), ResourceStates::COMMON)
            .unwrap();
        let second = context
            .create_resource(ResourceDesc::texture_2d(4, 4, 1, 1), ResourceStates::COMMON)
            .unwrap();
        let view = context.create_shader_resource_view(&first).unwrap();
        let before = view.sequence();

        context.rename_shader_resource_view(&view, Arc::clone(&second));
        assert!(view.sequence() > before);
        assert_eq!(view.resource().raw(), second.raw());
        assert_eq!(
            device.descriptor_at(view.descriptor()),
            Some(ViewDesc::ShaderResource { resource: second.raw() })
        );
    }

    #[test]
    fn test_close_and_submit_without_list_is_rejected() {
        let (_device, context) = setup();
        let mut commands = context.create_command_context(QueueType::Direct).unwrap();
        assert!(matches!(
            commands.close_and_submit(false),
            Err(GpuError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_dropping_context_discards_open_list() {
        let (_device, context) = setup();
        let mut commands = context.create_command_context(QueueType::Compute).unwrap();
        commands.dispatch(1, 1, 1).unwrap();
        drop(commands);

        let queue = context.queue(QueueType::Compute);
        assert_eq!(queue.live_command_lists(), 1);
        let list = queue.obtain_command_list().unwrap();
        assert_eq!(list.generation(), 1);
    }

    #[test]
    fn test_copy_context_records_without_descriptor_cache() {
        let (device, context) = setup();
        let mut commands = context.create_command_context(QueueType::Copy).unwrap();
        assert!(commands.descriptor_cache().is_none());

        let dst = Arc::new(Resource::new(RawResource(900), ResourceDesc::texture_2d(4, 4, 1, 1), ResourceStates::COMMON));
        let src = Arc::new(Resource::new(RawResource(901), ResourceDesc::texture_2d(4, 4, 1, 1), ResourceStates::COMMON));
        commands.acquire_command_list().unwrap().copy_resource(&dst, &src);
        commands.close_and_submit(false).unwrap();

        let barriers = device.executed_barriers(context.queue(QueueType::Copy).raw());
        assert_eq!(barriers.len(), 2);
        assert_eq!(dst.authoritative_state(0).known(), Some(ResourceStates::COPY_DEST));
        assert_eq!(commands.end_frame(), 0);
    }
}
