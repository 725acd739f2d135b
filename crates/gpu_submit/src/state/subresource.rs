//! Subresource addressing and per-subresource state storage

use super::TrackedState;
use crate::hal::{ResourceDesc, ResourceDimension};

/// Target of a single barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subresource {
    /// Every subresource at once
    All,
    /// One subresource by flat index
    Index(u32),
}

/// Rectangular range of mips, array slices and planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceSubset {
    /// First mip level
    pub first_mip: u16,
    /// Number of mip levels
    pub mip_count: u16,
    /// First array slice
    pub first_array_slice: u16,
    /// Number of array slices
    pub array_size: u16,
    /// First format plane
    pub first_plane: u8,
    /// Number of format planes
    pub plane_count: u8,
}

impl SubresourceSubset {
    /// Subset covering one mip level of every slice and plane
    pub fn mip(desc: &ResourceDesc, mip: u16) -> Self {
        Self {
            first_mip: mip,
            mip_count: 1,
            first_array_slice: 0,
            array_size: array_slices(desc),
            first_plane: 0,
            plane_count: desc.plane_count,
        }
    }

    /// Subset covering one array slice across every mip and plane
    pub fn array_slice(desc: &ResourceDesc, slice: u16) -> Self {
        Self {
            first_mip: 0,
            mip_count: desc.mip_levels,
            first_array_slice: slice,
            array_size: 1,
            first_plane: 0,
            plane_count: desc.plane_count,
        }
    }

    /// Flat subresource indices covered by the subset, in ascending order
    ///
    /// Indices follow the `mip + slice * mips + plane * mips * slices` layout.
    pub fn indices(&self, desc: &ResourceDesc) -> Vec<u32> {
        let mips = u32::from(desc.mip_levels);
        let slices = u32::from(array_slices(desc));

        assert!(
            u32::from(self.first_mip) + u32::from(self.mip_count) <= mips
                && u32::from(self.first_array_slice) + u32::from(self.array_size) <= slices
                && u32::from(self.first_plane) + u32::from(self.plane_count) <= u32::from(desc.plane_count),
            "subresource subset {self:?} exceeds resource bounds"
        );

        let mut indices = Vec::with_capacity(
            usize::from(self.mip_count) * usize::from(self.array_size) * usize::from(self.plane_count),
        );
        for plane in u32::from(self.first_plane)..u32::from(self.first_plane) + u32::from(self.plane_count) {
            for slice in u32::from(self.first_array_slice)
                ..u32::from(self.first_array_slice) + u32::from(self.array_size)
            {
                for mip in u32::from(self.first_mip)..u32::from(self.first_mip) + u32::from(self.mip_count) {
                    indices.push(mip + slice * mips + plane * mips * slices);
                }
            }
        }
        indices
    }
}

fn array_slices(desc: &ResourceDesc) -> u16 {
    match desc.dimension {
        ResourceDimension::Buffer | ResourceDimension::Texture3D => 1,
        _ => desc.array_size,
    }
}

/// Subresources affected by a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subresources {
    /// The whole resource
    All,
    /// A single subresource
    Single(u32),
    /// A mip/slice/plane range
    Subset(SubresourceSubset),
}

/// State of every subresource of one resource
///
/// Stays compact while every subresource shares one state and expands to one
/// entry per subresource only once states diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubresourceStates {
    /// All subresources share `state`
    Uniform {
        /// Number of subresources
        count: u32,
        /// Shared state
        state: TrackedState,
    },
    /// Individually tracked subresources
    PerSubresource(Vec<TrackedState>),
}

impl SubresourceStates {
    /// Every subresource in `state`
    pub const fn uniform(count: u32, state: TrackedState) -> Self {
        Self::Uniform { count, state }
    }

    /// Number of subresources
    pub fn count(&self) -> u32 {
        match self {
            Self::Uniform { count, .. } => *count,
            Self::PerSubresource(states) => states.len() as u32,
        }
    }

    /// State of one subresource
    pub fn get(&self, index: u32) -> TrackedState {
        assert!(index < self.count(), "subresource {index} out of range");
        match self {
            Self::Uniform { state, .. } => *state,
            Self::PerSubresource(states) => states[index as usize],
        }
    }

    /// The shared state when every subresource agrees
    pub fn uniform_state(&self) -> Option<TrackedState> {
        match self {
            Self::Uniform { state, .. } => Some(*state),
            Self::PerSubresource(states) => {
                let first = *states.first()?;
                states.iter().all(|s| *s == first).then_some(first)
            }
        }
    }

    /// Whether tracking has been upgraded to per-subresource granularity
    pub const fn is_per_subresource(&self) -> bool {
        matches!(self, Self::PerSubresource(_))
    }

    /// Put every subresource into `state`
    pub fn set_all(&mut self, state: TrackedState) {
        let count = self.count();
        *self = Self::Uniform { count, state };
    }

    /// Put one subresource into `state`, upgrading granularity if needed
    pub fn set(&mut self, index: u32, state: TrackedState) {
        let count = self.count();
        assert!(index < count, "subresource {index} out of range");
        match self {
            Self::Uniform { state: current, .. } if *current == state => {}
            Self::Uniform { state: current, .. } => {
                let mut states = vec![*current; count as usize];
                states[index as usize] = state;
                *self = Self::PerSubresource(states);
            }
            Self::PerSubresource(states) => states[index as usize] = state,
        }
    }

    /// Collapse back to a uniform state if every subresource agrees
    pub fn compact(&mut self) {
        if self.is_per_subresource() {
            if let Some(state) = self.uniform_state() {
                self.set_all(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceStates;

    const SRV: TrackedState = TrackedState::Known(ResourceStates::PIXEL_SHADER_RESOURCE);
    const RT: TrackedState = TrackedState::Known(ResourceStates::RENDER_TARGET);

    #[test]
    fn test_set_upgrades_and_compact_restores_uniform() {
        let mut states = SubresourceStates::uniform(4, SRV);
        states.set(2, RT);
        assert!(states.is_per_subresource());
        assert_eq!(states.get(2), RT);
        assert_eq!(states.get(1), SRV);
        assert_eq!(states.uniform_state(), None);

        states.set(2, SRV);
        states.compact();
        assert_eq!(states, SubresourceStates::uniform(4, SRV));
    }

    #[test]
    fn test_set_same_state_keeps_uniform() {
        let mut states = SubresourceStates::uniform(3, SRV);
        states.set(0, SRV);
        assert!(!states.is_per_subresource());
    }

    #[test]
    fn test_subset_indices_follow_mip_slice_plane_layout() {
        let desc = ResourceDesc::texture_2d(64, 64, 3, 2).with_planes(2);
        assert_eq!(desc.subresource_count(), 12);

        let subset = SubresourceSubset {
            first_mip: 1,
            mip_count: 2,
            first_array_slice: 1,
            array_size: 1,
            first_plane: 1,
            plane_count: 1,
        };
        // plane 1 starts at 3 * 2, slice 1 adds 3
        assert_eq!(subset.indices(&desc), vec![10, 11]);
    }

    #[test]
    fn test_mip_subset_spans_all_slices() {
        let desc = ResourceDesc::texture_2d(16, 16, 4, 3);
        assert_eq!(SubresourceSubset::mip(&desc, 2).indices(&desc), vec![2, 6, 10]);
        assert_eq!(SubresourceSubset::array_slice(&desc, 1).indices(&desc), vec![4, 5, 6, 7]);
    }

    #[test]
    #[should_panic(expected = "exceeds resource bounds")]
    fn test_subset_out_of_bounds_panics() {
        let desc = ResourceDesc::texture_2d(16, 16, 1, 1);
        let _ = SubresourceSubset::mip(&desc, 1).indices(&desc);
    }
}
