//! Error types for i2c-dev operations

use thiserror::Error;

/// I2C specific errors
#[derive(Debug, Error)]
pub enum I2cError {
    /// Failed to open the i2c-dev node
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        /// Device path that was attempted
        path: String,
        #[source]
        /// Underlying open error
        source: std::io::Error,
    },

    /// I2C_SLAVE ioctl failed
    #[error("Failed to select slave address 0x{addr:02X}: {source}")]
    SetSlaveFailed {
        /// 7-bit slave address
        addr: u16,
        #[source]
        /// Underlying ioctl error
        source: std::io::Error,
    },

    /// The given slave address is not a valid 7-bit address
    #[error("Invalid 7-bit slave address 0x{0:X}")]
    InvalidAddress(u16),
}

/// Result type for i2c-dev operations
pub type Result<T> = std::result::Result<T, I2cError>;
