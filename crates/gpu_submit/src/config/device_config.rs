//! # Device Configuration
//!
//! Capacity tunables for one logical device: online descriptor heap sizes, the
//! sub-allocation block size, offline staging heap size, and the command list
//! and batch limits.

use serde::{Deserialize, Serialize};

use super::{Config, ConfigError};

/// Largest sampler heap a device exposes to shaders
pub const MAX_SAMPLER_HEAP_CAPACITY: u32 = 2048;

/// Capacity tunables for a [`DeviceContext`](crate::DeviceContext)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Descriptor count of each thread-local online view heap
    pub view_heap_capacity: u32,
    /// Descriptor count of each thread-local online sampler heap
    pub sampler_heap_capacity: u32,
    /// Descriptor count of the device-wide view heap carved into blocks
    pub global_view_heap_capacity: u32,
    /// Descriptor count of one sub-allocated block
    pub sub_allocation_block_size: u32,
    /// Descriptor count of the global deduplicating sampler heap
    pub global_sampler_heap_capacity: u32,
    /// Descriptor count of each CPU-only staging heap
    pub offline_heap_capacity: u32,
    /// Hard cap on live command list objects per queue
    pub max_command_lists: usize,
    /// Number of outstanding batches per queue before sizing warnings are logged
    pub max_in_flight_batches: usize,
}

impl DeviceConfig {
    /// Create a configuration with default capacities
    pub fn new() -> Self {
        Self {
            view_heap_capacity: 16_384,
            sampler_heap_capacity: MAX_SAMPLER_HEAP_CAPACITY,
            global_view_heap_capacity: 262_144,
            sub_allocation_block_size: 4096,
            global_sampler_heap_capacity: MAX_SAMPLER_HEAP_CAPACITY,
            offline_heap_capacity: 256,
            max_command_lists: 256,
            max_in_flight_batches: 8,
        }
    }

    /// Set the thread-local view heap capacity
    pub fn with_view_heap_capacity(mut self, capacity: u32) -> Self {
        self.view_heap_capacity = capacity;
        self
    }

    /// Set the thread-local sampler heap capacity
    pub fn with_sampler_heap_capacity(mut self, capacity: u32) -> Self {
        self.sampler_heap_capacity = capacity;
        self
    }

    /// Set the device-wide sub-allocated view heap capacity and block size
    pub fn with_sub_allocation(mut self, global_capacity: u32, block_size: u32) -> Self {
        self.global_view_heap_capacity = global_capacity;
        self.sub_allocation_block_size = block_size;
        self
    }

    /// Set the global sampler heap capacity
    pub fn with_global_sampler_heap_capacity(mut self, capacity: u32) -> Self {
        self.global_sampler_heap_capacity = capacity;
        self
    }

    /// Set the offline staging heap capacity
    pub fn with_offline_heap_capacity(mut self, capacity: u32) -> Self {
        self.offline_heap_capacity = capacity;
        self
    }

    /// Set the hard cap on live command lists per queue
    pub fn with_max_command_lists(mut self, count: usize) -> Self {
        self.max_command_lists = count;
        self
    }

    /// Set the in-flight batch warning threshold
    pub fn with_max_in_flight_batches(mut self, count: usize) -> Self {
        self.max_in_flight_batches = count;
        self
    }

    /// Number of blocks the device-wide view heap is split into
    pub fn sub_allocation_block_count(&self) -> u32 {
        if self.sub_allocation_block_size == 0 {
            return 0;
        }
        self.global_view_heap_capacity / self.sub_allocation_block_size
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.view_heap_capacity == 0 {
            return Err(ConfigError::Invalid("View heap capacity must be at least 1".to_string()));
        }

        if self.sampler_heap_capacity == 0 || self.sampler_heap_capacity > MAX_SAMPLER_HEAP_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "Sampler heap capacity must be between 1 and {MAX_SAMPLER_HEAP_CAPACITY}"
            )));
        }

        if self.global_sampler_heap_capacity == 0
            || self.global_sampler_heap_capacity > MAX_SAMPLER_HEAP_CAPACITY
        {
            return Err(ConfigError::Invalid(format!(
                "Global sampler heap capacity must be between 1 and {MAX_SAMPLER_HEAP_CAPACITY}"
            )));
        }

        if self.sub_allocation_block_size == 0 {
            return Err(ConfigError::Invalid("Sub-allocation block size must be at least 1".to_string()));
        }

        if self.sub_allocation_block_count() == 0 {
            return Err(ConfigError::Invalid(
                "Global view heap must hold at least one sub-allocation block".to_string(),
            ));
        }

        if self.offline_heap_capacity == 0 {
            return Err(ConfigError::Invalid("Offline heap capacity must be at least 1".to_string()));
        }

        if self.max_command_lists == 0 {
            return Err(ConfigError::Invalid("Max command lists must be at least 1".to_string()));
        }

        if self.max_in_flight_batches == 0 {
            return Err(ConfigError::Invalid("Max in-flight batches must be at least 1".to_string()));
        }

        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for DeviceConfig {
    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}
