//! Per-stage binding state

use super::key::{MAX_SAMPLER_SLOTS, MAX_SHADER_RESOURCE_SLOTS};
use crate::descriptor::{ConstantBufferView, SamplerState, ShaderResourceView, UnorderedAccessView};

/// Constant buffer slots per stage
pub const MAX_CONSTANT_BUFFER_SLOTS: usize = 14;

/// Unordered access slots per stage
pub const MAX_UNORDERED_ACCESS_SLOTS: usize = 8;

/// What one shader stage has bound, plus what its offline staging tables hold
#[derive(Debug)]
pub(crate) struct StageBindings {
    pub(crate) constant_buffers: Vec<Option<ConstantBufferView>>,
    pub(crate) shader_resources: Vec<Option<ShaderResourceView>>,
    pub(crate) samplers: Vec<Option<SamplerState>>,
    pub(crate) unordered_access_views: Vec<Option<UnorderedAccessView>>,
    /// Identity of the descriptor in each staging slot; `None` until first written
    pub(crate) staged_shader_resources: Vec<Option<u64>>,
    pub(crate) staged_samplers: Vec<Option<u64>>,
    /// Samplers of a table currently bound out of the global heap
    pub(crate) global_sampler_table: Option<Vec<SamplerState>>,
}

impl StageBindings {
    pub(crate) fn new() -> Self {
        Self {
            constant_buffers: vec![None; MAX_CONSTANT_BUFFER_SLOTS],
            shader_resources: vec![None; MAX_SHADER_RESOURCE_SLOTS],
            samplers: vec![None; MAX_SAMPLER_SLOTS],
            unordered_access_views: vec![None; MAX_UNORDERED_ACCESS_SLOTS],
            staged_shader_resources: vec![None; MAX_SHADER_RESOURCE_SLOTS],
            staged_samplers: vec![None; MAX_SAMPLER_SLOTS],
            global_sampler_table: None,
        }
    }
}

/// Copy `values` into `slots` starting at `start`
///
/// # Panics
///
/// If the range runs past the end of `slots`.
pub(crate) fn assign<T: Clone>(slots: &mut [Option<T>], start: usize, values: &[Option<T>], what: &str) {
    let end = start + values.len();
    assert!(
        end <= slots.len(),
        "{what} slots {start}..{end} exceed the {} available",
        slots.len()
    );
    slots[start..end].clone_from_slice(values);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_overwrites_range() {
        let mut slots: Vec<Option<u32>> = vec![None; 4];
        assign(&mut slots, 1, &[Some(7), None, Some(9)], "test");
        assert_eq!(slots, vec![None, Some(7), None, Some(9)]);
    }

    #[test]
    #[should_panic(expected = "exceed the 4 available")]
    fn test_assign_out_of_range_panics() {
        let mut slots: Vec<Option<u32>> = vec![None; 4];
        assign(&mut slots, 3, &[Some(1), Some(2)], "test");
    }
}
