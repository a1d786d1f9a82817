//! gtflash-i2c - Linux i2c-dev transport
//!
//! Raw-I2C access to Berlin touch controllers through `/dev/i2c-N`.
//! Unlike the hidraw path there is no bridge translating feature
//! reports; register reads and writes go straight onto the bus with a
//! 4-byte big-endian register address, and protocol commands are framed
//! through the controller's command channel.
//!
//! # Example
//!
//! ```no_run
//! use gtflash_i2c::{I2cDevice, DEFAULT_SLAVE_ADDR};
//!
//! let dev = I2cDevice::open("/dev/i2c-3", DEFAULT_SLAVE_ADDR)?;
//! # Ok::<(), gtflash_i2c::I2cError>(())
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with i2c-dev support (`CONFIG_I2C_CHARDEV`)
//! - Read/write access to the `/dev/i2c-N` node

#![warn(missing_docs)]

pub mod device;
pub mod error;

pub use device::{I2cDevice, DEFAULT_SLAVE_ADDR};
pub use error::{I2cError, Result};
