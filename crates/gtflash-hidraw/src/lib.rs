//! gtflash-hidraw - Linux hidraw transport
//!
//! This crate binds the core update protocol to a Goodix touch controller
//! behind a `/dev/hidrawN` node. Register traffic rides on HID feature
//! reports exchanged with the `HIDIOCSFEATURE`/`HIDIOCGFEATURE` ioctls;
//! the HID bridge inside the controller translates them to register
//! accesses.
//!
//! # Example
//!
//! ```no_run
//! use gtflash_hidraw::HidrawDevice;
//! use gtflash_core::packet::PacketLayout;
//!
//! let dev = HidrawDevice::open("/dev/hidraw0", PacketLayout::CLASSIC)?;
//! println!("product code {}", dev.info().product_code());
//! # Ok::<(), gtflash_hidraw::HidrawError>(())
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with hidraw support (`CONFIG_HIDRAW`)
//! - Read/write access to the `/dev/hidrawN` node

#![warn(missing_docs)]

pub mod device;
pub mod error;

pub use device::{HidrawDevice, HidrawInfo, GOODIX_VENDOR_ID};
pub use error::{HidrawError, Result};
