//! Tracked GPU resources

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::{ResourceStates, SubresourceStates, TrackedState};
use crate::error::DeviceError;
use crate::hal::{HeapKind, NativeDevice, RawResource, ResourceDesc};

/// A GPU resource together with its authoritative subresource states
///
/// The authoritative map reflects the state every subresource will be in once
/// all submitted work has executed. It is only written on the submission path
/// while the queue's submission lock is held.
pub struct Resource {
    raw: RawResource,
    desc: ResourceDesc,
    default_state: ResourceStates,
    requires_tracking: bool,
    authoritative: Mutex<SubresourceStates>,
}

impl Resource {
    /// Wrap a native resource that starts out in `initial_state`
    ///
    /// Upload and readback heap resources stay in a fixed state for their
    /// whole lifetime and bypass tracking.
    pub fn new(raw: RawResource, desc: ResourceDesc, initial_state: ResourceStates) -> Self {
        let requires_tracking = desc.heap == HeapKind::Default;
        Self::with_tracked_state(raw, desc, initial_state, requires_tracking, TrackedState::Known(initial_state))
    }

    /// Wrap a native resource whose current state is not known yet
    ///
    /// Used for resources whose memory was aliased or handed over from outside;
    /// the first submitted transition defines the state. `default_state` is
    /// what scoped transitions assume before any list has touched it.
    pub fn with_unknown_state(raw: RawResource, desc: ResourceDesc, default_state: ResourceStates) -> Self {
        Self::with_tracked_state(raw, desc, default_state, true, TrackedState::Unknown)
    }

    /// Create a resource on `device` and wrap it
    pub fn create(
        device: &dyn NativeDevice,
        desc: ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<Arc<Self>, DeviceError> {
        let raw = device.create_resource(&desc)?;
        Ok(Arc::new(Self::new(raw, desc, initial_state)))
    }

    fn with_tracked_state(
        raw: RawResource,
        desc: ResourceDesc,
        default_state: ResourceStates,
        requires_tracking: bool,
        state: TrackedState,
    ) -> Self {
        let count = desc.subresource_count();
        Self {
            raw,
            desc,
            default_state,
            requires_tracking,
            authoritative: Mutex::new(SubresourceStates::uniform(count, state)),
        }
    }

    /// Native handle
    pub const fn raw(&self) -> RawResource {
        self.raw
    }

    /// Resource description
    pub const fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    /// State the resource was created in
    pub const fn default_state(&self) -> ResourceStates {
        self.default_state
    }

    /// Whether transitions go through the state tracker
    pub const fn requires_tracking(&self) -> bool {
        self.requires_tracking
    }

    /// Number of subresources
    pub fn subresource_count(&self) -> u32 {
        self.desc.subresource_count()
    }

    /// Authoritative state of one subresource
    pub fn authoritative_state(&self, index: u32) -> TrackedState {
        self.authoritative.lock().get(index)
    }

    /// Snapshot of the authoritative state map
    pub fn authoritative_states(&self) -> SubresourceStates {
        self.authoritative.lock().clone()
    }

    pub(crate) fn lock_authoritative(&self) -> MutexGuard<'_, SubresourceStates> {
        self.authoritative.lock()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("requires_tracking", &self.requires_tracking)
            .finish_non_exhaustive()
    }
}
