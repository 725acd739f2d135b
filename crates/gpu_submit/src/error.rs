//! Error types for command submission and descriptor management
//!
//! Two layers of errors exist: [`DeviceError`] is what a native backend reports,
//! [`GpuError`] is what the submission core hands back to callers. Device loss is
//! lifted into its own variant so owners can poll for it and stop submitting.
//!
//! Capacity exhaustion of the statically configured hard caps is not an error
//! value at all: it indicates mis-tuned constants and aborts through
//! [`configuration_exhausted`].

use thiserror::Error;

use crate::config::ConfigError;

/// Errors reported by a [`NativeDevice`](crate::hal::NativeDevice) backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device was removed or reset
    #[error("Device lost")]
    Lost,

    /// The backend ran out of memory creating an object
    #[error("Out of device memory creating {object}")]
    OutOfMemory {
        /// Kind of object that was being created
        object: &'static str,
    },

    /// The backend rejected an operation
    #[error("Invalid device operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation was rejected
        reason: String,
    },
}

/// Errors surfaced by the submission core
#[derive(Error, Debug)]
pub enum GpuError {
    /// The device has been lost; all further submissions short-circuit
    #[error("Device lost, submissions are disabled")]
    DeviceLost,

    /// Any other backend failure
    #[error("Device error: {0}")]
    Device(DeviceError),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<DeviceError> for GpuError {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::Lost => Self::DeviceLost,
            other => Self::Device(other),
        }
    }
}

/// Result type for submission core operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Abort after a hard capacity cap was exceeded.
///
/// Hitting one of these caps means an allocation leak or capacity constants that
/// are far too small; retrying cannot help.
#[track_caller]
pub fn configuration_exhausted(what: &str, limit: usize) -> ! {
    log::error!("Configuration exhausted: {} exceeded the hard cap of {}", what, limit);
    panic!("configuration exhausted: {what} exceeded the hard cap of {limit}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_maps_to_sticky_variant() {
        let error: GpuError = DeviceError::Lost.into();
        assert!(matches!(error, GpuError::DeviceLost));
    }

    #[test]
    fn test_other_device_errors_are_wrapped() {
        let error: GpuError = DeviceError::OutOfMemory { object: "descriptor heap" }.into();
        assert!(matches!(error, GpuError::Device(DeviceError::OutOfMemory { .. })));
        assert_eq!(
            error.to_string(),
            "Device error: Out of device memory creating descriptor heap"
        );
    }

    #[test]
    #[should_panic(expected = "configuration exhausted")]
    fn test_configuration_exhausted_panics() {
        configuration_exhausted("command lists", 4);
    }
}
