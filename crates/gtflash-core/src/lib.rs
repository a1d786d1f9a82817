//! gtflash-core - Core library for Goodix touch IC firmware updates
//!
//! This crate implements the firmware-image parser and the flash update
//! protocol shared by all supported Goodix touch-controller families.
//! Platform transports (hidraw, i2c-dev) live in sibling crates and plug in
//! through the [`transport::Transport`] trait.
//!
//! # Overview
//!
//! A firmware update run is assembled from four pieces:
//!
//! - a [`chip::ChipVariant`] describing the target family (register
//!   addresses, image layout, protocol knobs),
//! - a [`image::FirmwareImage`] parsed and checksum-verified from a vendor
//!   `.bin` file,
//! - a [`transport::Transport`] bound to the live device,
//! - an [`update::UpdateEngine`] that drives the mode-switch / stage /
//!   commit / reset sequence.
//!
//! ```ignore
//! use gtflash_core::chip::ChipFamily;
//! use gtflash_core::image::FirmwareImage;
//! use gtflash_core::update::{UpdateEngine, UpdateParams};
//!
//! let variant = ChipFamily::NormandyL.variant();
//! let image = FirmwareImage::load("fw.bin", variant)?;
//! let mut engine = UpdateEngine::new(transport, variant);
//! engine.run(&image, &UpdateParams::default())?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod checksum;
pub mod chip;
pub mod device;
pub mod error;
pub mod image;
pub mod packet;
pub mod transport;
pub mod update;

pub use error::{DeviceError, ImageError, TransportError, UpdateError};
