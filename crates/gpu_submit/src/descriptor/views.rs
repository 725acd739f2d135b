//! Views and samplers backed by offline descriptors
//!
//! Views are cheap handles; clones refer to the same descriptor. Shader
//! resource views carry a sequence number that changes whenever the view is
//! pointed at a different resource, which is what descriptor table keys are
//! built from.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::offline::OfflineDescriptor;
use crate::hal::{CpuDescriptorHandle, SamplerDesc, ViewDesc};
use crate::state::Resource;

struct ShaderResourceViewInner {
    descriptor: OfflineDescriptor,
    resource: Mutex<Arc<Resource>>,
    sequence: AtomicU64,
}

/// Shader resource view
#[derive(Clone)]
pub struct ShaderResourceView {
    inner: Arc<ShaderResourceViewInner>,
}

impl ShaderResourceView {
    pub(crate) fn new(descriptor: OfflineDescriptor, resource: Arc<Resource>, sequence: u64) -> Self {
        Self {
            inner: Arc::new(ShaderResourceViewInner {
                descriptor,
                resource: Mutex::new(resource),
                sequence: AtomicU64::new(sequence),
            }),
        }
    }

    /// Identity of the current view contents; never zero
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    /// Viewed resource
    pub fn resource(&self) -> Arc<Resource> {
        Arc::clone(&self.inner.resource.lock())
    }

    /// Source descriptor
    pub fn descriptor(&self) -> CpuDescriptorHandle {
        self.inner.descriptor.handle()
    }

    /// Point the view at `resource`, taking a new sequence number
    pub(crate) fn rename(&self, resource: Arc<Resource>, sequence: u64) {
        let mut current = self.inner.resource.lock();
        self.inner
            .descriptor
            .rewrite(&ViewDesc::ShaderResource { resource: resource.raw() });
        *current = resource;
        self.inner.sequence.store(sequence, Ordering::Release);
    }
}

impl fmt::Debug for ShaderResourceView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderResourceView")
            .field("sequence", &self.sequence())
            .field("descriptor", &self.descriptor())
            .finish()
    }
}

struct BufferViewInner {
    descriptor: OfflineDescriptor,
    resource: Arc<Resource>,
}

/// Constant buffer view
#[derive(Clone)]
pub struct ConstantBufferView {
    inner: Arc<BufferViewInner>,
}

impl ConstantBufferView {
    pub(crate) fn new(descriptor: OfflineDescriptor, resource: Arc<Resource>) -> Self {
        Self {
            inner: Arc::new(BufferViewInner { descriptor, resource }),
        }
    }

    /// Viewed buffer
    pub fn resource(&self) -> &Arc<Resource> {
        &self.inner.resource
    }

    /// Source descriptor
    pub fn descriptor(&self) -> CpuDescriptorHandle {
        self.inner.descriptor.handle()
    }
}

impl fmt::Debug for ConstantBufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantBufferView")
            .field("resource", &self.inner.resource.raw())
            .finish()
    }
}

/// Unordered access view
///
/// Binding one transitions its resource to unordered access.
#[derive(Clone)]
pub struct UnorderedAccessView {
    inner: Arc<BufferViewInner>,
}

impl UnorderedAccessView {
    pub(crate) fn new(descriptor: OfflineDescriptor, resource: Arc<Resource>) -> Self {
        Self {
            inner: Arc::new(BufferViewInner { descriptor, resource }),
        }
    }

    /// Viewed resource
    pub fn resource(&self) -> &Arc<Resource> {
        &self.inner.resource
    }

    /// Source descriptor
    pub fn descriptor(&self) -> CpuDescriptorHandle {
        self.inner.descriptor.handle()
    }
}

impl fmt::Debug for UnorderedAccessView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnorderedAccessView")
            .field("resource", &self.inner.resource.raw())
            .finish()
    }
}

struct SamplerStateInner {
    id: u32,
    desc: SamplerDesc,
    descriptor: OfflineDescriptor,
}

/// Immutable sampler with a stable id
///
/// Identical descriptions share one id; id 0 is the device's default sampler.
#[derive(Clone)]
pub struct SamplerState {
    inner: Arc<SamplerStateInner>,
}

impl SamplerState {
    /// Id of the device's default sampler
    pub const DEFAULT_ID: u32 = 0;

    pub(crate) fn new(id: u32, desc: SamplerDesc, descriptor: OfflineDescriptor) -> Self {
        Self {
            inner: Arc::new(SamplerStateInner { id, desc, descriptor }),
        }
    }

    /// Stable id
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Sampler description
    pub fn desc(&self) -> &SamplerDesc {
        &self.inner.desc
    }

    /// Source descriptor
    pub fn descriptor(&self) -> CpuDescriptorHandle {
        self.inner.descriptor.handle()
    }
}

impl fmt::Debug for SamplerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerState")
            .field("id", &self.inner.id)
            .field("desc", &self.inner.desc)
            .finish()
    }
}
