//! Error types for hidraw operations

use thiserror::Error;

/// Hidraw specific errors
#[derive(Debug, Error)]
pub enum HidrawError {
    /// Failed to open the hidraw node
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        /// Device path that was attempted
        path: String,
        #[source]
        /// Underlying open error
        source: std::io::Error,
    },

    /// HIDIOCGRAWINFO failed
    #[error("Failed to read device info: {0}")]
    InfoFailed(#[source] std::io::Error),

    /// The node does not answer like a Goodix touch controller
    #[error("{path} does not look like a supported touch controller (vendor {vendor:04X})")]
    NotGoodix {
        /// Device path
        path: String,
        /// HID vendor id reported by the kernel
        vendor: u16,
    },
}

/// Result type for hidraw operations
pub type Result<T> = std::result::Result<T, HidrawError>;
