//! CPU-only descriptor storage for view and sampler sources

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::heap::DescriptorHeap;
use crate::error::GpuResult;
use crate::hal::{CpuDescriptorHandle, DescriptorHeapType, NativeDevice, ViewDesc};

struct OfflineHeap {
    heap: DescriptorHeap,
    free: Vec<u32>,
}

/// Grow-only set of CPU-only heaps with per-heap free lists
///
/// Views and samplers keep their source descriptor here; binding copies it
/// into an online heap.
pub struct OfflineDescriptorManager {
    device: Arc<dyn NativeDevice>,
    heap_type: DescriptorHeapType,
    heap_capacity: u32,
    heaps: Mutex<Vec<OfflineHeap>>,
}

impl OfflineDescriptorManager {
    /// Create a manager whose heaps hold `heap_capacity` descriptors each
    pub fn new(device: Arc<dyn NativeDevice>, heap_type: DescriptorHeapType, heap_capacity: u32) -> Self {
        Self {
            device,
            heap_type,
            heap_capacity,
            heaps: Mutex::new(Vec::new()),
        }
    }

    /// Heap family
    pub const fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// Take a free slot and write `desc` into it
    pub fn allocate(self: &Arc<Self>, desc: &ViewDesc) -> GpuResult<OfflineDescriptor> {
        let (heap_index, slot, handle) = {
            let mut heaps = self.heaps.lock();
            let heap_index = match heaps.iter().position(|heap| !heap.free.is_empty()) {
                Some(index) => index,
                None => {
                    let heap = DescriptorHeap::new(Arc::clone(&self.device), self.heap_type, self.heap_capacity, false)?;
                    heaps.push(OfflineHeap {
                        heap,
                        free: (0..self.heap_capacity).rev().collect(),
                    });
                    log::debug!("Offline {} heaps grown to {}", self.heap_type, heaps.len());
                    heaps.len() - 1
                }
            };
            let entry = &mut heaps[heap_index];
            let slot = entry.free.pop().unwrap_or_default();
            (heap_index, slot, entry.heap.cpu_handle(slot))
        };

        self.device.create_view(handle, desc);
        Ok(OfflineDescriptor {
            manager: Arc::clone(self),
            heap_index,
            slot,
            handle,
        })
    }

    /// Number of backing heaps
    pub fn heap_count(&self) -> usize {
        self.heaps.lock().len()
    }

    /// Descriptors currently allocated
    pub fn allocated(&self) -> usize {
        let heaps = self.heaps.lock();
        heaps
            .iter()
            .map(|heap| self.heap_capacity as usize - heap.free.len())
            .sum()
    }

    fn free(&self, heap_index: usize, slot: u32) {
        if let Some(entry) = self.heaps.lock().get_mut(heap_index) {
            entry.free.push(slot);
        }
    }
}

impl fmt::Debug for OfflineDescriptorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineDescriptorManager")
            .field("heap_type", &self.heap_type)
            .field("heap_capacity", &self.heap_capacity)
            .finish_non_exhaustive()
    }
}

/// One allocated offline slot, freed on drop
pub struct OfflineDescriptor {
    manager: Arc<OfflineDescriptorManager>,
    heap_index: usize,
    slot: u32,
    handle: CpuDescriptorHandle,
}

impl OfflineDescriptor {
    /// CPU address of the descriptor
    pub const fn handle(&self) -> CpuDescriptorHandle {
        self.handle
    }

    /// Overwrite the descriptor in place
    pub fn rewrite(&self, desc: &ViewDesc) {
        self.manager.device.create_view(self.handle, desc);
    }
}

impl Drop for OfflineDescriptor {
    fn drop(&mut self) {
        self.manager.free(self.heap_index, self.slot);
    }
}

impl fmt::Debug for OfflineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineDescriptor")
            .field("heap_type", &self.manager.heap_type)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{DescriptorTableKind, NullDevice};

    #[test]
    fn test_manager_grows_and_reuses_slots() {
        let device = Arc::new(NullDevice::new());
        let manager = Arc::new(OfflineDescriptorManager::new(
            Arc::clone(&device) as Arc<dyn NativeDevice>,
            DescriptorHeapType::View,
            2,
        ));
        let desc = ViewDesc::Null(DescriptorTableKind::ShaderResources);

        let first = manager.allocate(&desc).unwrap();
        let second = manager.allocate(&desc).unwrap();
        let third = manager.allocate(&desc).unwrap();
        assert_eq!(manager.heap_count(), 2);
        assert_eq!(manager.allocated(), 3);
        assert_eq!(device.descriptor_at(third.handle()), Some(desc));

        let freed = second.handle();
        drop(second);
        let reused = manager.allocate(&desc).unwrap();
        assert_eq!(reused.handle(), freed);
        assert_eq!(manager.heap_count(), 2);
        drop(first);
    }
}
