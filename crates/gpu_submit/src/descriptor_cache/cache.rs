//! Per-context descriptor staging and binding

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::key::{SamplerTableKey, SrvTableKey, TableCache, MAX_SAMPLER_SLOTS, MAX_SHADER_RESOURCE_SLOTS};
use super::stage::{assign, StageBindings, MAX_CONSTANT_BUFFER_SLOTS, MAX_UNORDERED_ACCESS_SLOTS};
use crate::command::CommandList;
use crate::context::DeviceContext;
use crate::descriptor::{
    ConstantBufferView, DescriptorHeap, OnlineDescriptorHeap, RollOverOutcome, SamplerState, SamplerTableMap,
    ShaderResourceView, SubAllocatedHeap, ThreadLocalHeap, UnorderedAccessView,
};
use crate::error::{configuration_exhausted, GpuResult};
use crate::hal::{CpuDescriptorHandle, DescriptorHeapType, DescriptorTableKind, GpuDescriptorHandle, ShaderStage};
use crate::state::{Resource, ResourceStates, Subresources};

const SRV_TABLE_BUCKETS: usize = 1024;
const SAMPLER_TABLE_BUCKETS: usize = 256;

/// Strategy backing a cache's online view heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewHeapStrategy {
    /// A block of the device-wide view heap
    SubAllocated,
    /// A heap owned by this context
    ThreadLocal,
}

enum ViewHeap {
    SubAllocated(SubAllocatedHeap),
    ThreadLocal(ThreadLocalHeap),
}

impl ViewHeap {
    fn online(&self) -> &dyn OnlineDescriptorHeap {
        match self {
            Self::SubAllocated(heap) => heap,
            Self::ThreadLocal(heap) => heap,
        }
    }

    fn online_mut(&mut self) -> &mut dyn OnlineDescriptorHeap {
        match self {
            Self::SubAllocated(heap) => heap,
            Self::ThreadLocal(heap) => heap,
        }
    }

    fn strategy(&self) -> ViewHeapStrategy {
        match self {
            Self::SubAllocated(_) => ViewHeapStrategy::SubAllocated,
            Self::ThreadLocal(_) => ViewHeapStrategy::ThreadLocal,
        }
    }
}

/// Descriptor cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Shader resource tables found in the cache
    pub srv_hits: u64,
    /// Shader resource tables that had to be copied
    pub srv_misses: u64,
    /// Sampler tables found in the local cache
    pub sampler_hits: u64,
    /// Sampler tables that had to be copied
    pub sampler_misses: u64,
    /// Sampler tables bound straight out of the global heap
    pub global_sampler_hits: u64,
}

/// Binding layer between per-stage view slots and the online heaps
///
/// Owned by one recording context, so nothing here is locked except the
/// frame-end merge into the device's global sampler heap.
///
/// Shader resource and sampler tables are identified by a key built from the
/// bound views' sequence numbers (or sampler ids) and cached against the heap
/// range they were copied to. Constant buffer and unordered access tables are
/// copied on every bind.
pub struct DescriptorCache {
    device: Arc<DeviceContext>,
    view_heap: ViewHeap,
    sampler_heap: ThreadLocalHeap,
    srv_staging: DescriptorHeap,
    sampler_staging: DescriptorHeap,
    stages: Vec<StageBindings>,
    srv_tables: TableCache<MAX_SHADER_RESOURCE_SLOTS>,
    sampler_tables: TableCache<MAX_SAMPLER_SLOTS>,
    global_tables: Arc<SamplerTableMap>,
    using_global_samplers: bool,
    return_to_global_samplers: bool,
    frame_sampler_tables: HashMap<SamplerTableKey, Vec<SamplerState>>,
    generations: [u64; 2],
    global_sampler_hits: u64,
}

impl DescriptorCache {
    /// Create a cache, taking a view heap block from the device if one is free
    pub fn new(device: Arc<DeviceContext>) -> GpuResult<Self> {
        let native = Arc::clone(device.native());
        let config = device.config();

        let view_heap = match SubAllocatedHeap::new(Arc::clone(device.sub_allocation_pool())) {
            Some(heap) => ViewHeap::SubAllocated(heap),
            None => {
                log::warn!("No view heap block available; using a thread-local view heap");
                ViewHeap::ThreadLocal(ThreadLocalHeap::new(
                    Arc::clone(&native),
                    DescriptorHeapType::View,
                    config.view_heap_capacity,
                )?)
            }
        };
        let sampler_heap = ThreadLocalHeap::new(Arc::clone(&native), DescriptorHeapType::Sampler, config.sampler_heap_capacity)?;
        let srv_staging = DescriptorHeap::new(
            Arc::clone(&native),
            DescriptorHeapType::View,
            (ShaderStage::COUNT * MAX_SHADER_RESOURCE_SLOTS) as u32,
            false,
        )?;
        let sampler_staging = DescriptorHeap::new(
            native,
            DescriptorHeapType::Sampler,
            (ShaderStage::COUNT * MAX_SAMPLER_SLOTS) as u32,
            false,
        )?;
        let global_tables = device.global_sampler_heap().snapshot();

        Ok(Self {
            view_heap,
            sampler_heap,
            srv_staging,
            sampler_staging,
            stages: (0..ShaderStage::COUNT).map(|_| StageBindings::new()).collect(),
            srv_tables: TableCache::new(SRV_TABLE_BUCKETS),
            sampler_tables: TableCache::new(SAMPLER_TABLE_BUCKETS),
            global_tables,
            using_global_samplers: true,
            return_to_global_samplers: false,
            frame_sampler_tables: HashMap::new(),
            generations: [0; 2],
            global_sampler_hits: 0,
            device,
        })
    }

    /// Strategy currently backing the view heap
    pub fn view_heap_strategy(&self) -> ViewHeapStrategy {
        self.view_heap.strategy()
    }

    /// Whether sampler tables are currently looked up in the global heap
    pub const fn is_using_global_samplers(&self) -> bool {
        self.using_global_samplers
    }

    /// Bumped every time cached tables of `heap_type` are invalidated
    pub const fn descriptor_generation(&self, heap_type: DescriptorHeapType) -> u64 {
        self.generations[heap_type.index()]
    }

    /// Online heap reservations of `heap_type` are made from
    pub fn online_heap(&self, heap_type: DescriptorHeapType) -> &dyn OnlineDescriptorHeap {
        match heap_type {
            DescriptorHeapType::View => self.view_heap.online(),
            DescriptorHeapType::Sampler => &self.sampler_heap,
        }
    }

    /// Local sampler tables waiting for the next frame-end merge
    pub fn pending_sampler_tables(&self) -> usize {
        self.frame_sampler_tables.len()
    }

    /// Cache counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            srv_hits: self.srv_tables.hits(),
            srv_misses: self.srv_tables.misses(),
            sampler_hits: self.sampler_tables.hits(),
            sampler_misses: self.sampler_tables.misses(),
            global_sampler_hits: self.global_sampler_hits,
        }
    }

    /// Set constant buffer slots `start..` of `stage`
    pub fn set_constant_buffers(&mut self, stage: ShaderStage, start: usize, views: &[Option<ConstantBufferView>]) {
        assign(&mut self.stages[stage.index()].constant_buffers, start, views, "constant buffer");
    }

    /// Set shader resource slots `start..` of `stage`
    pub fn set_shader_resources(&mut self, stage: ShaderStage, start: usize, views: &[Option<ShaderResourceView>]) {
        assign(&mut self.stages[stage.index()].shader_resources, start, views, "shader resource");
    }

    /// Set sampler slots `start..` of `stage`; empty slots use the default sampler
    pub fn set_samplers(&mut self, stage: ShaderStage, start: usize, samplers: &[Option<SamplerState>]) {
        assign(&mut self.stages[stage.index()].samplers, start, samplers, "sampler");
    }

    /// Set unordered access slots `start..` of `stage`
    pub fn set_unordered_access_views(&mut self, stage: ShaderStage, start: usize, views: &[Option<UnorderedAccessView>]) {
        assign(&mut self.stages[stage.index()].unordered_access_views, start, views, "unordered access");
    }

    /// Reserve `count` contiguous online slots for `list`
    ///
    /// Rolls the heap over when it is full. A sub-allocated view heap that
    /// cannot satisfy the request is replaced by a thread-local heap for the
    /// rest of the cache's lifetime.
    pub fn reserve_descriptors(
        &mut self,
        list: &CommandList,
        heap_type: DescriptorHeapType,
        count: u32,
    ) -> GpuResult<u32> {
        self.make_room(heap_type, count)?;
        let heap = self.online_heap_mut(heap_type);
        let slot = heap.reserve(count);
        heap.notify_command_list(list.completion_token());
        Ok(slot)
    }

    /// Copy the first `slots_needed` constant buffers of `stage` and bind them
    pub fn bind_constant_buffers(&mut self, list: &mut CommandList, stage: ShaderStage, slots_needed: usize) -> GpuResult<()> {
        if slots_needed == 0 {
            return Ok(());
        }
        assert!(
            slots_needed <= MAX_CONSTANT_BUFFER_SLOTS,
            "{slots_needed} constant buffer slots requested, at most {MAX_CONSTANT_BUFFER_SLOTS} exist"
        );
        let null = self.device.null_descriptor(DescriptorTableKind::ConstantBuffers);
        let sources: Vec<CpuDescriptorHandle> = self.stages[stage.index()].constant_buffers[..slots_needed]
            .iter()
            .map(|view| view.as_ref().map_or(null, ConstantBufferView::descriptor))
            .collect();
        self.copy_and_bind_views(list, stage, DescriptorTableKind::ConstantBuffers, &sources)
    }

    /// Bind the first `slots_needed` shader resource views of `stage`
    ///
    /// A table whose views are unchanged since it was last copied is bound
    /// from the cached range without copying anything.
    pub fn bind_shader_resources(&mut self, list: &mut CommandList, stage: ShaderStage, slots_needed: usize) -> GpuResult<()> {
        if slots_needed == 0 {
            return Ok(());
        }
        assert!(
            slots_needed <= MAX_SHADER_RESOURCE_SLOTS,
            "{slots_needed} shader resource slots requested, at most {MAX_SHADER_RESOURCE_SLOTS} exist"
        );
        let stage_index = stage.index();
        let key = SrvTableKey::from_ids(
            self.stages[stage_index].shader_resources[..slots_needed]
                .iter()
                .map(|view| view.as_ref().map_or(0, ShaderResourceView::sequence)),
        );

        let slot = match self.srv_tables.lookup(&key) {
            Some(slot) => {
                self.view_heap.online_mut().notify_command_list(list.completion_token());
                slot
            }
            None => {
                let slot = self.reserve_descriptors(list, DescriptorHeapType::View, slots_needed as u32)?;
                let null = self.device.null_descriptor(DescriptorTableKind::ShaderResources);
                let native = Arc::clone(self.device.native());
                let staging_base = (stage_index * MAX_SHADER_RESOURCE_SLOTS) as u32;
                let bindings = &mut self.stages[stage_index];

                for (index, &id) in key.ids().iter().enumerate() {
                    if bindings.staged_shader_resources[index] == Some(id) {
                        continue;
                    }
                    let source = bindings.shader_resources[index]
                        .as_ref()
                        .map_or(null, ShaderResourceView::descriptor);
                    native.copy_descriptors_simple(
                        1,
                        self.srv_staging.cpu_handle(staging_base + index as u32),
                        source,
                        DescriptorHeapType::View,
                    );
                    bindings.staged_shader_resources[index] = Some(id);
                }
                native.copy_descriptors_simple(
                    slots_needed as u32,
                    self.view_heap.online().cpu_handle(slot),
                    self.srv_staging.cpu_handle(staging_base),
                    DescriptorHeapType::View,
                );
                self.srv_tables.insert(key, slot);
                slot
            }
        };

        let base = self.view_heap.online().gpu_handle(slot);
        self.bind_table(list, stage, DescriptorTableKind::ShaderResources, base);
        Ok(())
    }

    /// Bind the first `slots_needed` samplers of `stage`
    ///
    /// Tables already merged into the global heap are bound from there. The
    /// first table that is not switches the cache to its local sampler heap
    /// until [`Self::end_frame`].
    pub fn bind_samplers(&mut self, list: &mut CommandList, stage: ShaderStage, slots_needed: usize) -> GpuResult<()> {
        if slots_needed == 0 {
            return Ok(());
        }
        assert!(
            slots_needed <= MAX_SAMPLER_SLOTS,
            "{slots_needed} sampler slots requested, at most {MAX_SAMPLER_SLOTS} exist"
        );
        let default = self.device.default_sampler();
        let samplers: Vec<SamplerState> = self.stages[stage.index()].samplers[..slots_needed]
            .iter()
            .map(|sampler| sampler.as_ref().unwrap_or(default).clone())
            .collect();
        let key = sampler_table_key(&samplers);

        if self.using_global_samplers {
            if let Some(&slot) = self.global_tables.get(&key) {
                self.global_sampler_hits += 1;
                let base = self.device.global_sampler_heap().gpu_handle(slot);
                self.stages[stage.index()].global_sampler_table = Some(samplers);
                self.bind_table(list, stage, DescriptorTableKind::Samplers, base);
                return Ok(());
            }
            self.switch_to_local_samplers(list)?;
        }
        self.bind_local_samplers(list, stage, samplers, key)
    }

    /// Transition the first `slots_needed` unordered access resources of `stage`
    /// and bind their descriptors
    pub fn bind_unordered_access_views(
        &mut self,
        list: &mut CommandList,
        stage: ShaderStage,
        slots_needed: usize,
    ) -> GpuResult<()> {
        if slots_needed == 0 {
            return Ok(());
        }
        assert!(
            slots_needed <= MAX_UNORDERED_ACCESS_SLOTS,
            "{slots_needed} unordered access slots requested, at most {MAX_UNORDERED_ACCESS_SLOTS} exist"
        );
        let views = &self.stages[stage.index()].unordered_access_views[..slots_needed];
        let resources: Vec<Arc<Resource>> = views
            .iter()
            .flatten()
            .map(|view| Arc::clone(view.resource()))
            .collect();
        let null = self.device.null_descriptor(DescriptorTableKind::UnorderedAccessViews);
        let sources: Vec<CpuDescriptorHandle> = views
            .iter()
            .map(|view| view.as_ref().map_or(null, UnorderedAccessView::descriptor))
            .collect();

        for resource in &resources {
            list.transition_resource(resource, ResourceStates::UNORDERED_ACCESS, Subresources::All);
        }
        self.copy_and_bind_views(list, stage, DescriptorTableKind::UnorderedAccessViews, &sources)
    }

    /// The active heap of `heap_type` was replaced; cached ranges are gone
    pub fn heap_rolled_over(&mut self, heap_type: DescriptorHeapType) {
        self.invalidate(heap_type);
        log::debug!(
            "{} heap rolled over, descriptor generation {}",
            heap_type,
            self.descriptor_generation(heap_type)
        );
    }

    /// The active heap of `heap_type` is recycling slots; cached ranges are gone
    pub fn heap_looped_around(&mut self, heap_type: DescriptorHeapType) {
        self.invalidate(heap_type);
        log::trace!(
            "{} heap looped around, descriptor generation {}",
            heap_type,
            self.descriptor_generation(heap_type)
        );
    }

    /// Propose this frame's local sampler tables to the global heap; returns
    /// how many tables were new
    ///
    /// Lookups in the global heap resume with the next command list. A list
    /// still open keeps its local sampler heap, since tables already bound on
    /// it reference that heap.
    pub fn end_frame(&mut self) -> usize {
        let global = self.device.global_sampler_heap();
        let tables: Vec<(SamplerTableKey, Vec<CpuDescriptorHandle>)> = self
            .frame_sampler_tables
            .drain()
            .map(|(key, samplers)| (key, samplers.iter().map(SamplerState::descriptor).collect()))
            .collect();
        let added = if tables.is_empty() { 0 } else { global.merge_unique_tables(tables) };

        self.global_tables = global.snapshot();
        self.return_to_global_samplers = !self.using_global_samplers;
        added
    }

    /// A new command list starts recording; nothing is bound on it yet
    pub(crate) fn begin_command_list(&mut self) {
        for stage in &mut self.stages {
            stage.global_sampler_table = None;
        }
        if std::mem::take(&mut self.return_to_global_samplers) {
            log::trace!("Sampler tables looked up in the global heap again");
            self.using_global_samplers = true;
        }
    }

    fn online_heap_mut(&mut self, heap_type: DescriptorHeapType) -> &mut dyn OnlineDescriptorHeap {
        match heap_type {
            DescriptorHeapType::View => self.view_heap.online_mut(),
            DescriptorHeapType::Sampler => &mut self.sampler_heap,
        }
    }

    fn make_room(&mut self, heap_type: DescriptorHeapType, count: u32) -> GpuResult<()> {
        let limit = match heap_type {
            DescriptorHeapType::View => self.device.config().view_heap_capacity,
            DescriptorHeapType::Sampler => self.sampler_heap.capacity(),
        };
        if count > limit {
            configuration_exhausted(&format!("{heap_type} descriptors in one reservation"), limit as usize);
        }
        if count > self.online_heap(heap_type).capacity() {
            return self.fall_back_to_thread_local();
        }
        if self.online_heap(heap_type).can_reserve(count) {
            return Ok(());
        }

        match self.online_heap_mut(heap_type).roll_over()? {
            RollOverOutcome::RolledOver => self.heap_rolled_over(heap_type),
            RollOverOutcome::LoopedAround => self.heap_looped_around(heap_type),
            RollOverOutcome::Exhausted => {}
        }
        if !self.online_heap(heap_type).can_reserve(count) {
            self.fall_back_to_thread_local()?;
        }
        Ok(())
    }

    /// Permanently swap the view heap for a thread-local one
    fn fall_back_to_thread_local(&mut self) -> GpuResult<()> {
        let heap = ThreadLocalHeap::new(
            Arc::clone(self.device.native()),
            DescriptorHeapType::View,
            self.device.config().view_heap_capacity,
        )?;
        log::warn!("View heap block unavailable; context switches to a thread-local view heap for its lifetime");
        self.view_heap = ViewHeap::ThreadLocal(heap);
        self.heap_rolled_over(DescriptorHeapType::View);
        Ok(())
    }

    fn invalidate(&mut self, heap_type: DescriptorHeapType) {
        match heap_type {
            DescriptorHeapType::View => self.srv_tables.clear(),
            DescriptorHeapType::Sampler => self.sampler_tables.clear(),
        }
        self.generations[heap_type.index()] += 1;
    }

    fn switch_to_local_samplers(&mut self, list: &mut CommandList) -> GpuResult<()> {
        self.using_global_samplers = false;
        log::trace!("Sampler table missing from the global heap; binding samplers locally");

        // Tables bound from the global heap must move with the heap binding
        for stage in ShaderStage::ALL {
            if let Some(samplers) = self.stages[stage.index()].global_sampler_table.take() {
                let key = sampler_table_key(&samplers);
                self.bind_local_samplers(list, stage, samplers, key)?;
            }
        }
        Ok(())
    }

    fn bind_local_samplers(
        &mut self,
        list: &mut CommandList,
        stage: ShaderStage,
        samplers: Vec<SamplerState>,
        key: SamplerTableKey,
    ) -> GpuResult<()> {
        let stage_index = stage.index();
        let slot = match self.sampler_tables.lookup(&key) {
            Some(slot) => {
                self.sampler_heap.notify_command_list(list.completion_token());
                slot
            }
            None => {
                let slot = self.reserve_descriptors(list, DescriptorHeapType::Sampler, samplers.len() as u32)?;
                let native = Arc::clone(self.device.native());
                let staging_base = (stage_index * MAX_SAMPLER_SLOTS) as u32;
                let staged = &mut self.stages[stage_index].staged_samplers;

                for (index, sampler) in samplers.iter().enumerate() {
                    let id = u64::from(sampler.id());
                    if staged[index] == Some(id) {
                        continue;
                    }
                    native.copy_descriptors_simple(
                        1,
                        self.sampler_staging.cpu_handle(staging_base + index as u32),
                        sampler.descriptor(),
                        DescriptorHeapType::Sampler,
                    );
                    staged[index] = Some(id);
                }
                native.copy_descriptors_simple(
                    samplers.len() as u32,
                    self.sampler_heap.cpu_handle(slot),
                    self.sampler_staging.cpu_handle(staging_base),
                    DescriptorHeapType::Sampler,
                );
                self.sampler_tables.insert(key, slot);
                slot
            }
        };

        if !self.global_tables.contains_key(&key) {
            self.frame_sampler_tables.entry(key).or_insert(samplers);
        }
        let base = self.sampler_heap.gpu_handle(slot);
        self.bind_table(list, stage, DescriptorTableKind::Samplers, base);
        Ok(())
    }

    fn copy_and_bind_views(
        &mut self,
        list: &mut CommandList,
        stage: ShaderStage,
        kind: DescriptorTableKind,
        sources: &[CpuDescriptorHandle],
    ) -> GpuResult<()> {
        let slot = self.reserve_descriptors(list, DescriptorHeapType::View, sources.len() as u32)?;
        self.device
            .native()
            .copy_descriptors(self.view_heap.online().cpu_handle(slot), sources, DescriptorHeapType::View);
        let base = self.view_heap.online().gpu_handle(slot);
        self.bind_table(list, stage, kind, base);
        Ok(())
    }

    fn bind_table(&self, list: &mut CommandList, stage: ShaderStage, kind: DescriptorTableKind, base: GpuDescriptorHandle) {
        let sampler_heap = if self.using_global_samplers {
            self.device.global_sampler_heap().raw()
        } else {
            self.sampler_heap.raw()
        };
        list.set_descriptor_heaps(self.view_heap.online().raw(), sampler_heap);
        list.set_descriptor_table(stage, kind, base);
    }
}

fn sampler_table_key(samplers: &[SamplerState]) -> SamplerTableKey {
    SamplerTableKey::from_ids(samplers.iter().map(|sampler| u64::from(sampler.id())))
}

impl fmt::Debug for DescriptorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorCache")
            .field("view_heap", &self.view_heap.strategy())
            .field("using_global_samplers", &self.using_global_samplers)
            .field("generations", &self.generations)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
