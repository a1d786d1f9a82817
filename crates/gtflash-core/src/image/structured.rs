//! Structured (Berlin) firmware container
//!
//! A 512-byte summary header leads the file: `[0..4)` little-endian
//! firmware size minus the 8-byte prefix, `[4..8)` a 32-bit sum of
//! little-endian 16-bit words over `[8..fw_size)`, identity fields, then
//! 10-byte little-endian subsystem records from offset 42. Payloads are
//! concatenated from offset 512. Bytes past `fw_size` are a config
//! region: 64 reserved bytes, then the config payload with its version
//! byte at payload offset 34.

use crate::checksum::sum16_le_u32;
use crate::error::ImageError;
use crate::image::{trim_pid, ConfigBlock, Parsed, Subsystem};

const SIZE_PREFIX_LEN: usize = 8;
const HEADER_LEN: usize = 512;
const PID_OFFSET: usize = 17;
const PID_LEN: usize = 8;
const VID_OFFSET: usize = 25;
const SUBSYS_COUNT_OFFSET: usize = 29;
const SUBSYS_INFO_OFFSET: usize = 42;
const SUBSYS_RECORD_LEN: usize = 10;
const SUBSYS_MAX: usize = 47;
const CFG_RESERVED_LEN: usize = 64;
const CFG_VERSION_OFFSET: usize = 34;

pub(crate) fn parse(blob: &[u8]) -> Result<Parsed, ImageError> {
    if blob.len() < HEADER_LEN {
        return Err(ImageError::Truncated {
            need: HEADER_LEN,
            have: blob.len(),
        });
    }

    let firmware_size =
        u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize + SIZE_PREFIX_LEN;
    if firmware_size < HEADER_LEN || firmware_size > blob.len() {
        return Err(ImageError::SizeMismatch {
            declared: firmware_size,
            file_len: blob.len(),
        });
    }

    let expected = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
    let computed = sum16_le_u32(&blob[SIZE_PREFIX_LEN..firmware_size]);
    if computed != expected {
        return Err(ImageError::ChecksumMismatch { computed, expected });
    }

    let product_id = trim_pid(&blob[PID_OFFSET..PID_OFFSET + PID_LEN]);
    let vid = &blob[VID_OFFSET..VID_OFFSET + 4];

    let count = blob[SUBSYS_COUNT_OFFSET] as usize;
    if count > SUBSYS_MAX {
        return Err(ImageError::TooManySubsystems {
            count,
            max: SUBSYS_MAX,
        });
    }

    let mut subsystems = Vec::with_capacity(count);
    let mut data_pos = HEADER_LEN;
    for index in 0..count {
        let rec = &blob[SUBSYS_INFO_OFFSET + index * SUBSYS_RECORD_LEN..];
        let kind = rec[0];
        let len = u32::from_le_bytes([rec[1], rec[2], rec[3], rec[4]]) as usize;
        let flash_addr = u32::from_le_bytes([rec[5], rec[6], rec[7], rec[8]]);
        if data_pos + len > firmware_size {
            return Err(ImageError::SubsystemOverflow {
                index,
                offset: data_pos,
                len,
                payload_len: firmware_size,
            });
        }
        subsystems.push(Subsystem {
            kind,
            flash_addr,
            data: data_pos..data_pos + len,
        });
        data_pos += len;
    }

    let (config, cfg_version) = if firmware_size < blob.len() {
        let cfg_start = firmware_size + CFG_RESERVED_LEN;
        if cfg_start + CFG_VERSION_OFFSET >= blob.len() {
            return Err(ImageError::Truncated {
                need: cfg_start + CFG_VERSION_OFFSET + 1,
                have: blob.len(),
            });
        }
        let version = blob[cfg_start + CFG_VERSION_OFFSET];
        (
            Some(ConfigBlock::Whole {
                data: cfg_start..blob.len(),
                version,
            }),
            version,
        )
    } else {
        (None, 0)
    };

    // Low byte of the minor composite is the config version, taken from
    // the bundled config when present.
    let version_minor =
        ((vid[2] as u32) << 16) | ((vid[3] as u32) << 8) | cfg_version as u32;

    Ok(Parsed {
        product_id,
        version_major: 0,
        version_minor,
        firmware_size,
        subsystems,
        config,
    })
}


#[cfg(test)]
mod tests {
    use super::testutil::StructuredImageBuilder;
    use super::*;
    use crate::chip::ChipFamily;
    use crate::image::{FirmwareImage, UpdateFlag};

    fn berlin() -> &'static crate::chip::ChipVariant {
        ChipFamily::BerlinB.variant()
    }

    #[test]
    fn image_with_bootloader_and_patch_parses() {
        let blob = StructuredImageBuilder::new()
            .pid("9966")
            .vid([0x00, 0x00, 0x01, 0x04])
            .subsystem(1, 0x0000, &[0xB0; 64])
            .subsystem(2, 0x2000, &[0x11; 1000])
            .build();
        let img = FirmwareImage::parse(blob, berlin()).unwrap();
        assert_eq!(img.product_id(), "9966");
        assert_eq!(img.version_major(), 0);
        assert_eq!(img.version_minor(), 0x010400);
        assert_eq!(img.subsystems().len(), 2);
        assert_eq!(img.subsystems()[1].flash_addr, 0x2000);
        assert_eq!(img.subsystem_data(&img.subsystems()[1]).len(), 1000);
        assert!(!img.has_config());
        assert_eq!(img.update_flag(), UpdateFlag::FIRMWARE);
    }

    #[test]
    fn config_version_lands_in_minor_low_byte() {
        let blob = StructuredImageBuilder::new()
            .vid([0x00, 0x00, 0x01, 0x04])
            .subsystem(1, 0x0000, &[0xB0; 64])
            .config(&[0xCC; 200], 0x09)
            .build();
        let img = FirmwareImage::parse(blob, berlin()).unwrap();
        assert!(img.has_config());
        assert_eq!(img.version_minor(), 0x010409);
        match img.config() {
            Some(ConfigBlock::Whole { data, version }) => {
                assert_eq!(*version, 0x09);
                assert_eq!(data.len(), 200);
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn word_sum_flip_is_rejected() {
        let mut blob = StructuredImageBuilder::new()
            .subsystem(1, 0x0000, &[0xB0; 64])
            .build();
        let last = blob.len() - 1;
        blob[last] ^= 0x80;
        assert!(matches!(
            FirmwareImage::parse(blob, berlin()),
            Err(ImageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn short_file_is_rejected() {
        assert!(matches!(
            FirmwareImage::parse(vec![0u8; 100], berlin()),
            Err(ImageError::Truncated { need: 512, .. })
        ));
    }

    #[test]
    fn declared_size_past_eof_is_rejected() {
        let mut blob = StructuredImageBuilder::new()
            .subsystem(1, 0x0000, &[0xB0; 64])
            .build();
        blob[0..4].copy_from_slice(&0x10000u32.to_le_bytes());
        assert!(matches!(
            FirmwareImage::parse(blob, berlin()),
            Err(ImageError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn oversized_subsystem_count_is_rejected() {
        let mut blob = StructuredImageBuilder::new()
            .subsystem(1, 0x0000, &[0xB0; 64])
            .build();
        blob[SUBSYS_COUNT_OFFSET] = 48;
        let fw_size = blob.len();
        let cks = crate::checksum::sum16_le_u32(&blob[SIZE_PREFIX_LEN..fw_size]);
        blob[4..8].copy_from_slice(&cks.to_le_bytes());
        assert!(matches!(
            FirmwareImage::parse(blob, berlin()),
            Err(ImageError::TooManySubsystems { count: 48, max: 47 })
        ));
    }

    #[test]
    fn subsystem_overflow_is_rejected() {
        let mut blob = StructuredImageBuilder::new()
            .subsystem(1, 0x0000, &[0xB0; 64])
            .build();
        let rec = SUBSYS_INFO_OFFSET;
        blob[rec + 1..rec + 5].copy_from_slice(&0x8000u32.to_le_bytes());
        let fw_size = blob.len();
        let cks = crate::checksum::sum16_le_u32(&blob[SIZE_PREFIX_LEN..fw_size]);
        blob[4..8].copy_from_slice(&cks.to_le_bytes());
        assert!(matches!(
            FirmwareImage::parse(blob, berlin()),
            Err(ImageError::SubsystemOverflow { index: 0, .. })
        ));
    }
}
