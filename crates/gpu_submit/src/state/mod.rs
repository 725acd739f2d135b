//! Resource state tracking
//!
//! Every tracked [`Resource`] carries an authoritative per-subresource state map
//! describing what the GPU will have executed once all submitted work
//! completes. Each command list keeps its own tentative view in a
//! [`ListStateTracker`]: transitions against a known list-local state are
//! recorded as barriers immediately, while the first touch of a resource is
//! deferred as a pending barrier and resolved against the authoritative map
//! under the queue's submission lock.

use bitflags::bitflags;

mod resource;
mod scoped;
mod subresource;
mod tracker;

pub use resource::Resource;
pub use scoped::ScopedTransition;
pub use subresource::{Subresource, SubresourceStates, SubresourceSubset, Subresources};
pub use tracker::{ListStateTracker, PendingBarrier};
pub(crate) use tracker::StagedStates;

bitflags! {
    /// GPU usage states a subresource can be in
    ///
    /// Read-only states may be combined; write states are exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        /// Common / presentable state
        const COMMON = 0;
        /// Vertex or constant buffer reads
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        /// Index buffer reads
        const INDEX_BUFFER = 1 << 1;
        /// Render target writes
        const RENDER_TARGET = 1 << 2;
        /// Unordered access reads and writes
        const UNORDERED_ACCESS = 1 << 3;
        /// Depth-stencil writes (and reads)
        const DEPTH_WRITE = 1 << 4;
        /// Read-only depth-stencil
        const DEPTH_READ = 1 << 5;
        /// Shader reads outside the pixel stage
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        /// Pixel shader reads
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        /// Indirect argument reads
        const INDIRECT_ARGUMENT = 1 << 8;
        /// Copy destination
        const COPY_DEST = 1 << 9;
        /// Copy source
        const COPY_SOURCE = 1 << 10;
        /// Shader reads from any stage
        const ALL_SHADER_RESOURCE = Self::NON_PIXEL_SHADER_RESOURCE.bits() | Self::PIXEL_SHADER_RESOURCE.bits();
        /// Every read state an upload heap resource is permanently in
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceStates {
    const WRITE_STATES: Self = Self::RENDER_TARGET
        .union(Self::UNORDERED_ACCESS)
        .union(Self::DEPTH_WRITE)
        .union(Self::COPY_DEST);

    /// Whether no write state is included
    pub fn is_read_only(self) -> bool {
        !self.intersects(Self::WRITE_STATES)
    }

    /// Whether a subresource in `self` can serve `requested` without a barrier
    ///
    /// Write-capable depth covers read-only depth.
    pub fn satisfies(self, requested: Self) -> bool {
        self == requested || (self == Self::DEPTH_WRITE && requested == Self::DEPTH_READ)
    }
}

/// State of a subresource as seen by one tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedState {
    /// Not yet observed; the first transition becomes a pending barrier
    Unknown,
    /// Determinate state
    Known(ResourceStates),
}

impl TrackedState {
    /// The state if known
    pub const fn known(self) -> Option<ResourceStates> {
        match self {
            Self::Known(state) => Some(state),
            Self::Unknown => None,
        }
    }

    /// Whether the state is still unknown
    pub const fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_write_satisfies_depth_read() {
        assert!(ResourceStates::DEPTH_WRITE.satisfies(ResourceStates::DEPTH_READ));
        assert!(!ResourceStates::DEPTH_READ.satisfies(ResourceStates::DEPTH_WRITE));
        assert!(!ResourceStates::RENDER_TARGET.satisfies(ResourceStates::PIXEL_SHADER_RESOURCE));
    }

    #[test]
    fn test_read_only_classification() {
        assert!(ResourceStates::GENERIC_READ.is_read_only());
        assert!(ResourceStates::ALL_SHADER_RESOURCE.is_read_only());
        assert!(!ResourceStates::COPY_DEST.is_read_only());
        assert!(!(ResourceStates::UNORDERED_ACCESS | ResourceStates::COPY_SOURCE).is_read_only());
    }
}
