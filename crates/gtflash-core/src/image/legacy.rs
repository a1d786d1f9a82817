//! Legacy firmware container
//!
//! Layout: `[0..4)` big-endian firmware size, `[4..6)` 16-bit byte sum
//! over the firmware region `[6..6+size)`, identity fields at
//! family-specific offsets, 8-byte subsystem records at the info offset,
//! concatenated payloads at the data offset. Files longer than
//! `size + 6` carry a trailing config block: `{pack_len:2 BE, flag,
//! count, checksum:2 BE}` header, 3-byte `{sensor_id, len:2 BE}` index
//! entries, config payloads starting 64 bytes into the block.

use crate::checksum::sum8;
use crate::chip::{ChipVariant, ImageMajor, ImageMinor, SubsysLenField};
use crate::error::ImageError;
use crate::image::{trim_pid, ConfigBlock, Parsed, SubConfig, Subsystem, UpdateFlag};

const HEADER_LEN: usize = 6;
const SUBSYS_RECORD_LEN: usize = 8;
const CFG_HEADER_LEN: usize = 6;
const CFG_DATA_OFFSET: usize = 64;
const CFG_INDEX_ENTRY_LEN: usize = 3;

pub(crate) fn parse(blob: &[u8], variant: &ChipVariant) -> Result<Parsed, ImageError> {
    let layout = &variant.layout;
    if blob.len() < layout.subsys_data_offset {
        return Err(ImageError::Truncated {
            need: layout.subsys_data_offset,
            have: blob.len(),
        });
    }

    let firmware_size = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    let fw_end = firmware_size + HEADER_LEN;
    if fw_end > blob.len() {
        return Err(ImageError::SizeMismatch {
            declared: firmware_size,
            file_len: blob.len(),
        });
    }

    let expected = u16::from_be_bytes([blob[4], blob[5]]);
    let computed = sum8(&blob[HEADER_LEN..fw_end]);
    if computed != expected {
        return Err(ImageError::ChecksumMismatch {
            computed: computed as u32,
            expected: expected as u32,
        });
    }

    let product_id = trim_pid(&blob[layout.pid_offset..layout.pid_offset + layout.pid_len]);

    let version_major = match layout.major {
        ImageMajor::Zero => 0,
        ImageMajor::Cid => layout.cid_offset.map(|o| blob[o] as u32).unwrap_or(0),
        ImageMajor::Vid0 => blob[layout.vid_offset] as u32,
    };
    let v = &blob[layout.vid_offset..layout.vid_offset + 3];
    let version_minor = match layout.minor {
        ImageMinor::ThreeByte => {
            ((v[0] as u32) << 16) | ((v[1] as u32) << 8) | v[2] as u32
        }
        ImageMinor::CfgReserved => ((v[1] as u32) << 16) | ((v[2] as u32) << 8),
    };

    let count = blob[layout.subsys_count_offset] as usize;
    let max = (layout.subsys_data_offset - layout.subsys_info_offset) / SUBSYS_RECORD_LEN;
    if count > max {
        return Err(ImageError::TooManySubsystems { count, max });
    }

    let mut subsystems = Vec::with_capacity(count);
    let mut data_pos = layout.subsys_data_offset;
    for index in 0..count {
        let rec = &blob[layout.subsys_info_offset + index * SUBSYS_RECORD_LEN..];
        let kind = rec[0];
        let (len, flash_addr) = match layout.subsys_len_field {
            SubsysLenField::Word => (
                u16::from_be_bytes([rec[1], rec[2]]) as usize,
                (u16::from_be_bytes([rec[3], rec[4]]) as u32) << 8,
            ),
            SubsysLenField::DWord => (
                u32::from_be_bytes([rec[1], rec[2], rec[3], rec[4]]) as usize,
                (u16::from_be_bytes([rec[5], rec[6]]) as u32) << 8,
            ),
        };
        if data_pos + len > fw_end {
            return Err(ImageError::SubsystemOverflow {
                index,
                offset: data_pos,
                len,
                payload_len: fw_end,
            });
        }
        subsystems.push(Subsystem {
            kind,
            flash_addr,
            data: data_pos..data_pos + len,
        });
        data_pos += len;
    }

    let config = if fw_end != blob.len() {
        Some(parse_config(blob, fw_end)?)
    } else {
        None
    };

    Ok(Parsed {
        product_id,
        version_major,
        version_minor,
        firmware_size,
        subsystems,
        config,
    })
}

fn parse_config(blob: &[u8], cfg_start: usize) -> Result<ConfigBlock, ImageError> {
    let trailing = blob.len() - cfg_start;
    if trailing < CFG_DATA_OFFSET {
        return Err(ImageError::Truncated {
            need: cfg_start + CFG_DATA_OFFSET,
            have: blob.len(),
        });
    }
    let cfg = &blob[cfg_start..];
    let pack_len = u16::from_be_bytes([cfg[0], cfg[1]]) as usize;
    if pack_len + CFG_HEADER_LEN != trailing {
        return Err(ImageError::ConfigSizeMismatch {
            declared: pack_len + CFG_HEADER_LEN,
            trailing,
        });
    }

    let expected = u16::from_be_bytes([cfg[4], cfg[5]]);
    let computed = sum8(&cfg[CFG_HEADER_LEN..]);
    if computed != expected {
        return Err(ImageError::ConfigChecksumMismatch { computed, expected });
    }

    let flag = UpdateFlag::from_bits_truncate(cfg[2]);
    let count = cfg[3] as usize;
    let max = (CFG_DATA_OFFSET - CFG_HEADER_LEN) / CFG_INDEX_ENTRY_LEN;
    if count > max {
        return Err(ImageError::TooManySubsystems { count, max });
    }

    let mut sub_configs = Vec::with_capacity(count);
    let mut data_pos = cfg_start + CFG_DATA_OFFSET;
    for index in 0..count {
        let entry = &cfg[CFG_HEADER_LEN + index * CFG_INDEX_ENTRY_LEN..];
        let sensor_id = entry[0];
        let len = u16::from_be_bytes([entry[1], entry[2]]) as usize;
        if data_pos + len > blob.len() {
            return Err(ImageError::SubsystemOverflow {
                index,
                offset: data_pos,
                len,
                payload_len: blob.len(),
            });
        }
        sub_configs.push(SubConfig {
            sensor_id,
            data: data_pos..data_pos + len,
        });
        data_pos += len;
    }

    Ok(ConfigBlock::Legacy { flag, sub_configs })
}


#[cfg(test)]
mod tests {
    use super::testutil::LegacyImageBuilder;
    use super::*;
    use crate::chip::ChipFamily;
    use crate::image::FirmwareImage;

    #[test]
    fn two_subsystem_image_parses() {
        let variant = ChipFamily::Phoenix.variant();
        let blob = LegacyImageBuilder::new(variant)
            .pid("1234")
            .cid(3)
            .vid([0x01, 0x02, 0x03])
            .subsystem(2, 0x2000, &[0x11; 300])
            .subsystem(3, 0x9000, &[0x22; 100])
            .build();
        let img = FirmwareImage::parse(blob, variant).unwrap();
        assert_eq!(img.product_id(), "1234");
        assert_eq!(img.version_major(), 3);
        // the minor's low byte shares offset 26 with the subsystem count
        assert_eq!(img.version_minor(), 0x010202);
        let subs = img.subsystems();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].kind, 2);
        assert_eq!(subs[0].flash_addr, 0x2000);
        assert_eq!(img.subsystem_data(&subs[0]), &[0x11; 300][..]);
        assert_eq!(subs[1].flash_addr, 0x9000);
        assert_eq!(img.subsystem_data(&subs[1]).len(), 100);
    }

    #[test]
    fn normandy_minor_reserves_config_byte() {
        let variant = ChipFamily::NormandyL.variant();
        let b = LegacyImageBuilder::new(variant)
            .pid("7863")
            .vid([0x09, 0x02, 0x03])
            .subsystem(2, 0x2000, &[0u8; 16]);
        let expect_major = b.expected_major();
        let expect_minor = b.expected_minor();
        let img = FirmwareImage::parse(b.build(), variant).unwrap();
        assert_eq!(img.version_major(), expect_major);
        assert_eq!(expect_major, 0x09);
        assert_eq!(img.version_minor(), expect_minor);
        assert_eq!(expect_minor, 0x020300);
    }

    #[test]
    fn mousepad_uses_short_records_and_zero_major() {
        let variant = ChipFamily::Mousepad.variant();
        let blob = LegacyImageBuilder::new(variant)
            .pid("7288")
            .vid([0x01, 0x05, 0x0A])
            .subsystem(0x0E, 0x3000, &[0x33; 40])
            .build();
        let img = FirmwareImage::parse(blob, variant).unwrap();
        assert_eq!(img.version_major(), 0);
        assert_eq!(img.version_minor(), 0x01050A);
        assert_eq!(img.subsystems()[0].flash_addr, 0x3000);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let variant = ChipFamily::Phoenix.variant();
        let mut blob = LegacyImageBuilder::new(variant)
            .subsystem(2, 0x2000, &[0u8; 32])
            .build();
        blob.pop();
        assert!(matches!(
            FirmwareImage::parse(blob, variant),
            Err(ImageError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn payload_bit_flip_is_rejected() {
        let variant = ChipFamily::Phoenix.variant();
        let mut blob = LegacyImageBuilder::new(variant)
            .subsystem(2, 0x2000, &[0u8; 32])
            .build();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            FirmwareImage::parse(blob, variant),
            Err(ImageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn oversized_subsystem_count_is_rejected() {
        let variant = ChipFamily::Phoenix.variant();
        let mut blob = LegacyImageBuilder::new(variant)
            .subsystem(2, 0x2000, &[0u8; 32])
            .build();
        let off = variant.layout.subsys_count_offset;
        blob[off] = 200;
        // re-seal the firmware checksum after the edit
        let cks = crate::checksum::sum8(&blob[6..]);
        blob[4..6].copy_from_slice(&cks.to_be_bytes());
        assert!(matches!(
            FirmwareImage::parse(blob, variant),
            Err(ImageError::TooManySubsystems { .. })
        ));
    }

    #[test]
    fn subsystem_length_overflow_is_rejected() {
        let variant = ChipFamily::Phoenix.variant();
        let mut blob = LegacyImageBuilder::new(variant)
            .subsystem(2, 0x2000, &[0u8; 32])
            .build();
        let rec = variant.layout.subsys_info_offset;
        blob[rec + 1..rec + 5].copy_from_slice(&0x10000u32.to_be_bytes());
        let cks = crate::checksum::sum8(&blob[6..]);
        blob[4..6].copy_from_slice(&cks.to_be_bytes());
        assert!(matches!(
            FirmwareImage::parse(blob, variant),
            Err(ImageError::SubsystemOverflow { .. })
        ));
    }

    #[test]
    fn bundled_config_is_detected_and_indexed() {
        let variant = ChipFamily::Phoenix.variant();
        let blob = LegacyImageBuilder::new(variant)
            .pid("7388")
            .subsystem(2, 0x2000, &[0u8; 32])
            .config(0b0011, &[(1, &[0xC1; 20]), (4, &[0xC4; 30])])
            .build();
        let img = FirmwareImage::parse(blob, variant).unwrap();
        assert!(img.has_config());
        assert_eq!(
            img.update_flag(),
            UpdateFlag::FIRMWARE | UpdateFlag::CONFIG
        );
        let cfg = img.sub_config_for(4).unwrap();
        assert_eq!(cfg.sensor_id, 4);
        assert_eq!(img.bytes(cfg.data.clone()), &[0xC4; 30][..]);
        assert!(img.sub_config_for(9).is_none());
    }

    #[test]
    fn config_checksum_error_is_rejected() {
        let variant = ChipFamily::Phoenix.variant();
        let mut blob = LegacyImageBuilder::new(variant)
            .subsystem(2, 0x2000, &[0u8; 32])
            .config(0b0010, &[(1, &[0xC1; 20])])
            .build();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(matches!(
            FirmwareImage::parse(blob, variant),
            Err(ImageError::ConfigChecksumMismatch { .. })
        ));
    }

    #[test]
    fn config_pack_length_mismatch_is_rejected() {
        let variant = ChipFamily::Phoenix.variant();
        let mut blob = LegacyImageBuilder::new(variant)
            .subsystem(2, 0x2000, &[0u8; 32])
            .config(0b0010, &[(1, &[0xC1; 20])])
            .build();
        blob.push(0);
        assert!(matches!(
            FirmwareImage::parse(blob, variant),
            Err(ImageError::ConfigSizeMismatch { .. })
        ));
    }
}
