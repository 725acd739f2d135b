//! Device-wide deduplicating sampler heap

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::heap::{DescriptorHeap, OnlineDescriptorHeap, RollOverOutcome};
use crate::descriptor_cache::SamplerTableKey;
use crate::error::GpuResult;
use crate::hal::{
    CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle, NativeDevice, RawDescriptorHeap,
};
use crate::sync::CompletionToken;

/// Table key → first slot in the global sampler heap
pub type SamplerTableMap = HashMap<SamplerTableKey, u32>;

/// Contents of the global sampler heap, guarded by [`GlobalSamplerHeap::lock`]
pub struct GlobalSamplerTables {
    heap: DescriptorHeap,
    cursor: u32,
    tables: SamplerTableMap,
    dirty: bool,
    snapshot: Arc<SamplerTableMap>,
    exhausted_logged: bool,
}

impl GlobalSamplerTables {
    /// Slot of an already merged table
    pub fn lookup(&self, key: &SamplerTableKey) -> Option<u32> {
        self.tables.get(key).copied()
    }

    /// Number of unique tables stored
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Whether tables were added since the last snapshot
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl OnlineDescriptorHeap for GlobalSamplerTables {
    fn heap_type(&self) -> DescriptorHeapType {
        DescriptorHeapType::Sampler
    }

    fn raw(&self) -> RawDescriptorHeap {
        self.heap.raw()
    }

    fn capacity(&self) -> u32 {
        self.heap.capacity()
    }

    fn cursor(&self) -> u32 {
        self.cursor
    }

    fn reserve(&mut self, count: u32) -> u32 {
        assert!(self.can_reserve(count), "global sampler heap cannot reserve {count} slots");
        let slot = self.cursor;
        self.cursor += count;
        slot
    }

    /// Tables live for the device's lifetime, so nothing is ever recycled
    fn roll_over(&mut self) -> GpuResult<RollOverOutcome> {
        if !self.exhausted_logged {
            self.exhausted_logged = true;
            log::warn!(
                "Global sampler heap full with {} tables; new tables stay context-local",
                self.tables.len()
            );
        }
        Ok(RollOverOutcome::Exhausted)
    }

    fn notify_command_list(&mut self, _token: &CompletionToken) {}

    fn cpu_handle(&self, slot: u32) -> CpuDescriptorHandle {
        self.heap.cpu_handle(slot)
    }

    fn gpu_handle(&self, slot: u32) -> GpuDescriptorHandle {
        self.heap.gpu_handle(slot)
    }
}

/// Sampler tables shared by every context of a device
///
/// Contexts look tables up in a read-only snapshot while recording and
/// propose the unique tables they had to build locally at frame end. Identical
/// tables from different contexts end up in one heap region.
pub struct GlobalSamplerHeap {
    device: Arc<dyn NativeDevice>,
    raw: RawDescriptorHeap,
    inner: Mutex<GlobalSamplerTables>,
}

impl GlobalSamplerHeap {
    /// Create the heap with room for `capacity` samplers
    pub fn new(device: Arc<dyn NativeDevice>, capacity: u32) -> GpuResult<Self> {
        let heap = DescriptorHeap::new(Arc::clone(&device), DescriptorHeapType::Sampler, capacity, true)?;
        Ok(Self {
            device,
            raw: heap.raw(),
            inner: Mutex::new(GlobalSamplerTables {
                heap,
                cursor: 0,
                tables: HashMap::new(),
                dirty: false,
                snapshot: Arc::new(HashMap::new()),
                exhausted_logged: false,
            }),
        })
    }

    /// Native handle
    pub const fn raw(&self) -> RawDescriptorHeap {
        self.raw
    }

    /// Enter the critical section
    pub fn lock(&self) -> MutexGuard<'_, GlobalSamplerTables> {
        self.inner.lock()
    }

    /// GPU address of `slot`
    pub fn gpu_handle(&self, slot: u32) -> GpuDescriptorHandle {
        self.inner.lock().gpu_handle(slot)
    }

    /// Copy tables not seen before into the heap; returns how many were added
    ///
    /// Each table is given as the source descriptors of its slots, in order.
    pub fn merge_unique_tables<I>(&self, tables: I) -> usize
    where
        I: IntoIterator<Item = (SamplerTableKey, Vec<CpuDescriptorHandle>)>,
    {
        let mut inner = self.inner.lock();
        let mut added = 0;

        for (key, sources) in tables {
            if inner.tables.contains_key(&key) {
                continue;
            }
            let count = sources.len() as u32;
            if !inner.can_reserve(count) && inner.roll_over().ok() != Some(RollOverOutcome::LoopedAround) {
                break;
            }
            let slot = inner.reserve(count);
            self.device
                .copy_descriptors(inner.cpu_handle(slot), &sources, DescriptorHeapType::Sampler);
            inner.tables.insert(key, slot);
            inner.dirty = true;
            added += 1;
        }

        if added > 0 {
            log::debug!("Merged {} sampler tables into the global heap ({} total)", added, inner.tables.len());
        }
        added
    }

    /// Current table map, rebuilt only when tables were added since the last call
    pub fn snapshot(&self) -> Arc<SamplerTableMap> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            inner.snapshot = Arc::new(inner.tables.clone());
            inner.dirty = false;
        }
        Arc::clone(&inner.snapshot)
    }
}

impl fmt::Debug for GlobalSamplerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalSamplerHeap")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::OfflineDescriptorManager;
    use crate::hal::{NullDevice, SamplerDesc, ViewDesc};

    #[test]
    fn test_identical_tables_merge_once() {
        let device = Arc::new(NullDevice::new());
        let native: Arc<dyn NativeDevice> = Arc::clone(&device) as Arc<dyn NativeDevice>;
        let offline = Arc::new(OfflineDescriptorManager::new(Arc::clone(&native), DescriptorHeapType::Sampler, 8));
        let sampler = offline.allocate(&ViewDesc::Sampler(SamplerDesc::default())).unwrap();
        let global = GlobalSamplerHeap::new(native, 16).unwrap();

        let key = SamplerTableKey::from_ids([0, 0]);
        let sources = vec![sampler.handle(), sampler.handle()];
        assert_eq!(global.merge_unique_tables([(key, sources.clone())]), 1);
        assert_eq!(global.merge_unique_tables([(key, sources)]), 0);

        let snapshot = global.snapshot();
        assert_eq!(snapshot.get(&key), Some(&0));
        assert!(!global.lock().is_dirty());
        assert!(Arc::ptr_eq(&snapshot, &global.snapshot()));

        let copied = global.lock().cpu_handle(1);
        assert_eq!(device.descriptor_at(copied), Some(ViewDesc::Sampler(SamplerDesc::default())));
    }

    #[test]
    fn test_full_heap_stops_merging() {
        let device: Arc<dyn NativeDevice> = Arc::new(NullDevice::new());
        let offline = Arc::new(OfflineDescriptorManager::new(Arc::clone(&device), DescriptorHeapType::Sampler, 8));
        let sampler = offline.allocate(&ViewDesc::Sampler(SamplerDesc::default())).unwrap();
        let global = GlobalSamplerHeap::new(device, 3).unwrap();

        let tables = (1..=3).map(|id| (SamplerTableKey::from_ids([id, id]), vec![sampler.handle(); 2]));
        assert_eq!(global.merge_unique_tables(tables), 1);
        assert_eq!(global.lock().table_count(), 1);
    }
}
