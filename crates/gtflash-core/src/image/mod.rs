//! Firmware image parsing
//!
//! Vendor `.bin` files come in two containers: the legacy size-prefixed
//! blob used by every family up to GT7868Q, and the structured
//! 512-byte-header format used by Berlin parts. Parsing is done once at
//! load; all accessors afterwards are pure slices into the owned blob.

mod legacy;
mod structured;

use std::ops::Range;
use std::path::Path;

use bitflags::bitflags;
use log::{debug, info};

use crate::chip::{ChipVariant, ImageFormat};
use crate::error::ImageError;

#[cfg(test)]
pub(crate) use legacy::testutil;
#[cfg(test)]
pub(crate) use structured::testutil as structured_testutil;

bitflags! {
    /// Update request bits carried in a legacy config block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateFlag: u8 {
        /// Flash the firmware subsystems
        const FIRMWARE = 1 << 0;
        /// Download the config
        const CONFIG = 1 << 1;
        /// Write the config through the ISP instead of the interactive
        /// handshake
        const CONFIG_VIA_ISP = 1 << 2;
        /// Force the HID subsystem to be reflashed
        const HID_SUBSYSTEM = 1 << 3;
    }
}

/// One entry of the subsystem table.
#[derive(Debug, Clone)]
pub struct Subsystem {
    /// Subsystem type id (bit position in the update mask)
    pub kind: u8,
    /// Destination flash address
    pub flash_addr: u32,
    /// Payload location within the image blob
    pub data: Range<usize>,
}

/// One sensor-specific config in a legacy config block.
#[derive(Debug, Clone)]
pub struct SubConfig {
    /// Sensor id this config belongs to
    pub sensor_id: u8,
    /// Payload location within the image blob
    pub data: Range<usize>,
}

/// Parsed trailing config region.
#[derive(Debug, Clone)]
pub enum ConfigBlock {
    /// Legacy indexed block: per-sensor configs plus the update flag
    Legacy {
        /// Raw update-request bits
        flag: UpdateFlag,
        /// Per-sensor configs in index order
        sub_configs: Vec<SubConfig>,
    },
    /// Structured single-config region (Berlin)
    Whole {
        /// Config payload location within the blob
        data: Range<usize>,
        /// Config version byte
        version: u8,
    },
}

pub(crate) struct Parsed {
    pub product_id: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub firmware_size: usize,
    pub subsystems: Vec<Subsystem>,
    pub config: Option<ConfigBlock>,
}

/// A loaded, checksum-verified firmware image.
pub struct FirmwareImage {
    blob: Vec<u8>,
    parsed: Parsed,
}

impl FirmwareImage {
    /// Read and parse a firmware file for the given chip variant.
    pub fn load<P: AsRef<Path>>(
        path: P,
        variant: &ChipVariant,
    ) -> Result<FirmwareImage, ImageError> {
        let blob = std::fs::read(path)?;
        Self::parse(blob, variant)
    }

    /// Parse an in-memory firmware blob.
    pub fn parse(blob: Vec<u8>, variant: &ChipVariant) -> Result<FirmwareImage, ImageError> {
        let parsed = match variant.format {
            ImageFormat::Legacy => legacy::parse(&blob, variant)?,
            ImageFormat::Structured => structured::parse(&blob)?,
        };
        info!(
            "firmware image: pid {:?}, version {:#x}.{:#06x}, {} subsystem(s), config: {}",
            parsed.product_id,
            parsed.version_major,
            parsed.version_minor,
            parsed.subsystems.len(),
            parsed.config.is_some(),
        );
        for s in &parsed.subsystems {
            debug!(
                "  subsystem type {} at 0x{:06X}, {} bytes",
                s.kind,
                s.flash_addr,
                s.data.len()
            );
        }
        Ok(FirmwareImage { blob, parsed })
    }

    /// Product id string (NUL padding stripped, `7869` normalized to
    /// `7868Q`).
    pub fn product_id(&self) -> &str {
        &self.parsed.product_id
    }

    /// Major version byte.
    pub fn version_major(&self) -> u32 {
        self.parsed.version_major
    }

    /// Minor version composite; the low byte is the config version slot.
    pub fn version_minor(&self) -> u32 {
        self.parsed.version_minor
    }

    /// Length of the firmware region in bytes.
    pub fn firmware_size(&self) -> usize {
        self.parsed.firmware_size
    }

    /// Whether the file carries a trailing config region.
    pub fn has_config(&self) -> bool {
        self.parsed.config.is_some()
    }

    /// Parsed config region, if any.
    pub fn config(&self) -> Option<&ConfigBlock> {
        self.parsed.config.as_ref()
    }

    /// Update request bits; files without a config default to firmware.
    pub fn update_flag(&self) -> UpdateFlag {
        match &self.parsed.config {
            Some(ConfigBlock::Legacy { flag, .. }) => *flag,
            _ => UpdateFlag::FIRMWARE,
        }
    }

    /// Subsystem table in file order.
    pub fn subsystems(&self) -> &[Subsystem] {
        &self.parsed.subsystems
    }

    /// Payload bytes of a subsystem.
    pub fn subsystem_data(&self, subsys: &Subsystem) -> &[u8] {
        &self.blob[subsys.data.clone()]
    }

    /// Payload bytes of an arbitrary blob range.
    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.blob[range]
    }

    /// Find the legacy sub-config matching a sensor id.
    pub fn sub_config_for(&self, sensor_id: u8) -> Option<&SubConfig> {
        match &self.parsed.config {
            Some(ConfigBlock::Legacy { sub_configs, .. }) => {
                sub_configs.iter().find(|c| c.sensor_id == sensor_id)
            }
            _ => None,
        }
    }
}

pub(crate) fn trim_pid(raw: &[u8]) -> String {
    let pid: String = raw
        .iter()
        .copied()
        .filter(|&b| b != 0)
        .map(|b| b as char)
        .collect();
    if pid == "7869" {
        "7868Q".to_string()
    } else {
        pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipFamily;

    #[test]
    fn update_flag_defaults_to_firmware_without_config() {
        let variant = ChipFamily::NormandyL.variant();
        let blob = testutil::LegacyImageBuilder::new(variant)
            .pid("7863")
            .vid([0x01, 0x02, 0x03])
            .subsystem(2, 0x2000, &[0xAB; 64])
            .build();
        let img = FirmwareImage::parse(blob, variant).unwrap();
        assert!(!img.has_config());
        assert_eq!(img.update_flag(), UpdateFlag::FIRMWARE);
    }

    #[test]
    fn pid_7869_is_normalized() {
        assert_eq!(trim_pid(b"7869\0\0\0\0"), "7868Q");
        assert_eq!(trim_pid(b"7863\0\0\0\0"), "7863");
    }
}
