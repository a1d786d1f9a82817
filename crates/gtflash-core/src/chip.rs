//! Chip family descriptions
//!
//! Every supported touch controller family is described by a static
//! [`ChipVariant`] record: firmware image layout, identity register
//! addresses, and the protocol knobs the update engine keys off. The
//! engine and parser are generic over these records, so adding a family
//! means adding a table entry, not code.

/// Supported controller families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    /// GTx2 series (GT7288 and friends)
    Mousepad,
    /// GTx5 series (GT8589 and friends)
    Nanjing,
    /// GTx3 series (GT7388 and friends)
    Phoenix,
    /// GTx8 series (GT7863)
    NormandyL,
    /// GT7868Q
    Yellowstone,
    /// GT7726
    BerlinA,
    /// GTx9 series (GT9966), HID or raw I2C
    BerlinB,
}

/// Firmware image container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Size-prefixed blob with an 8-byte subsystem table and optional
    /// trailing config block
    Legacy,
    /// 512-byte summary header with 10-byte little-endian subsystem
    /// records (Berlin)
    Structured,
}

/// Width of the length field in a legacy subsystem record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsysLenField {
    /// 16-bit big-endian length at record offset 1, flash address at 3
    Word,
    /// 32-bit big-endian length at record offset 1, flash address at 5
    DWord,
}

/// How the image major version is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMajor {
    /// Always zero
    Zero,
    /// The CID byte
    Cid,
    /// First VID byte
    Vid0,
}

/// How the image minor composite is derived from the VID bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMinor {
    /// `(vid0 << 16) | (vid1 << 8) | vid2`
    ThreeByte,
    /// `(vid1 << 16) | (vid2 << 8)`, low byte reserved for the device
    /// config version
    CfgReserved,
}

/// Legacy image byte layout for one family.
#[derive(Debug, Clone, Copy)]
pub struct ImageLayout {
    /// Product id string offset
    pub pid_offset: usize,
    /// Product id field length (NUL padded)
    pub pid_len: usize,
    /// CID byte offset, when the family carries one
    pub cid_offset: Option<usize>,
    /// First VID byte offset
    pub vid_offset: usize,
    /// Subsystem count byte offset
    pub subsys_count_offset: usize,
    /// Subsystem record table offset
    pub subsys_info_offset: usize,
    /// Start of concatenated subsystem payloads
    pub subsys_data_offset: usize,
    /// Record length-field width
    pub subsys_len_field: SubsysLenField,
    /// Major version source
    pub major: ImageMajor,
    /// Minor composite construction
    pub minor: ImageMinor,
}

/// Integrity check applied to the firmware info block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoCheck {
    /// No embedded checksum
    None,
    /// Byte sum over the whole block must be zero mod 256
    Sum8Zero,
    /// Byte sum over `block[..len-2]` must equal the big-endian u16 tail
    TailSum,
}

/// How live version registers decode into device properties.
#[derive(Debug, Clone, Copy)]
pub enum InfoDecode {
    /// Fixed-offset fields inside the info block, minor composite
    /// completed with the separately-read config version byte
    Block {
        /// PID offset inside the block (4 ASCII bytes)
        pid_at: usize,
        /// Sensor id byte offset
        sensor_at: usize,
        /// Mask applied to the sensor id byte
        sensor_mask: u8,
        /// Major version byte offset
        major_at: usize,
        /// First of the two minor VID bytes
        vid_at: usize,
        /// Embedded checksum scheme
        check: InfoCheck,
    },
    /// BCD-coded major/minor at block offsets 5 and 6
    Bcd,
    /// Berlin identity block plus the config id block named by
    /// [`ChipVariant::config_id_addr`]
    Berlin,
}

/// Interactive config download handshake style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigHandshake {
    /// Family has no interactive config path
    Unsupported,
    /// Bare command bytes: `80 00 80`, poll 0x82, payload, `83`,
    /// poll 0xFF
    Plain {
        /// Wait for the command register to read 0xFF before starting
        wait_idle: bool,
    },
    /// 5-byte checksummed command frames, completion sentinel 0x7F
    /// (0x7E 00 07 means the config already matches), end frame 0x7D
    Checksummed,
    /// Berlin prepare/ready/end special commands with readback compare
    Berlin,
}

/// Flash protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// ISP via 16-bit registers: patch switch report, 0x5095/0x5096
    /// sentinels, 0xC000 staging buffer
    Classic,
    /// Minisystem via 32-bit registers: command frames, 0x10010/0x10011
    /// sentinels, 0x14000 staging buffer
    Berlin,
}

/// Static description of one controller family.
#[derive(Debug, Clone, Copy)]
pub struct ChipVariant {
    /// Family tag
    pub family: ChipFamily,
    /// Display name
    pub name: &'static str,
    /// Image container format
    pub format: ImageFormat,
    /// Legacy image layout (ignored for structured images)
    pub layout: ImageLayout,
    /// Firmware info block register
    pub version_addr: u32,
    /// Firmware info block length
    pub info_len: usize,
    /// Config version register, also the interactive staging area
    pub cfg_reg: Option<u32>,
    /// Command register for the interactive config handshake
    pub cmd_reg: Option<u32>,
    /// Flash address for config written through the ISP
    pub cfg_flash_addr: Option<u32>,
    /// Config id block register (Berlin): 4-byte id plus a version byte
    pub config_id_addr: Option<u32>,
    /// Register decode scheme
    pub decode: InfoDecode,
    /// Interactive config handshake style
    pub handshake: ConfigHandshake,
    /// Protocol generation
    pub protocol: Protocol,
    /// 32-bit register addresses on the wire
    pub wide_addr: bool,
    /// Default subsystem type mask
    pub default_mask: u32,
    /// Number of PID bytes compared during eligibility
    pub pid_compare_len: usize,
    /// Versions below `(major << 16) | minor` force the HID subsystem
    /// (type 5) into the update mask
    pub hid_boundary: Option<u32>,
    /// Treat a nonzero config version checksum after download as fatal
    pub strict_cfg_check: bool,
    /// Disable coordinate reporting while reading version registers
    pub coord_report_guard: bool,
    /// Device PID "7288" moves the version fields one byte up
    pub pid7288_quirk: bool,
}

const LEGACY_X2: ImageLayout = ImageLayout {
    pid_offset: 15,
    pid_len: 6,
    cid_offset: None,
    vid_offset: 21,
    subsys_count_offset: 24,
    subsys_info_offset: 32,
    subsys_data_offset: 128,
    subsys_len_field: SubsysLenField::Word,
    major: ImageMajor::Zero,
    minor: ImageMinor::ThreeByte,
};

const LEGACY_X5: ImageLayout = ImageLayout {
    pid_offset: 15,
    pid_len: 8,
    cid_offset: Some(23),
    vid_offset: 24,
    subsys_count_offset: 26,
    subsys_info_offset: 32,
    subsys_data_offset: 256,
    subsys_len_field: SubsysLenField::DWord,
    major: ImageMajor::Cid,
    minor: ImageMinor::ThreeByte,
};

const LEGACY_X8: ImageLayout = ImageLayout {
    pid_offset: 15,
    pid_len: 8,
    cid_offset: Some(23),
    vid_offset: 24,
    subsys_count_offset: 27,
    subsys_info_offset: 32,
    subsys_data_offset: 256,
    subsys_len_field: SubsysLenField::DWord,
    major: ImageMajor::Vid0,
    minor: ImageMinor::CfgReserved,
};

// Structured images ignore the legacy layout; keep a placeholder so the
// variant records stay uniform.
const STRUCTURED: ImageLayout = ImageLayout {
    pid_offset: 0,
    pid_len: 0,
    cid_offset: None,
    vid_offset: 0,
    subsys_count_offset: 0,
    subsys_info_offset: 0,
    subsys_data_offset: 0,
    subsys_len_field: SubsysLenField::DWord,
    major: ImageMajor::Zero,
    minor: ImageMinor::ThreeByte,
};

static MOUSEPAD: ChipVariant = ChipVariant {
    family: ChipFamily::Mousepad,
    name: "GTx2",
    format: ImageFormat::Legacy,
    layout: LEGACY_X2,
    version_addr: 0x8140,
    info_len: 12,
    cfg_reg: Some(0x8050),
    cmd_reg: None,
    cfg_flash_addr: None,
    config_id_addr: None,
    decode: InfoDecode::Block {
        pid_at: 0,
        sensor_at: 10,
        sensor_mask: 0x0F,
        major_at: 4,
        vid_at: 5,
        check: InfoCheck::None,
    },
    handshake: ConfigHandshake::Unsupported,
    protocol: Protocol::Classic,
    wide_addr: false,
    default_mask: 0x1400C,
    pid_compare_len: 4,
    hid_boundary: None,
    strict_cfg_check: false,
    coord_report_guard: false,
    pid7288_quirk: true,
};

static NANJING: ChipVariant = ChipVariant {
    family: ChipFamily::Nanjing,
    name: "GTx5",
    format: ImageFormat::Legacy,
    layout: LEGACY_X5,
    version_addr: 0x8240,
    info_len: 12,
    cfg_reg: Some(0x8050),
    cmd_reg: Some(0x8040),
    cfg_flash_addr: Some(0x3E000),
    config_id_addr: None,
    decode: InfoDecode::Bcd,
    handshake: ConfigHandshake::Plain { wait_idle: false },
    protocol: Protocol::Classic,
    wide_addr: false,
    default_mask: 0x1400C,
    pid_compare_len: 4,
    hid_boundary: Some(0x0117),
    strict_cfg_check: false,
    coord_report_guard: false,
    pid7288_quirk: false,
};

static PHOENIX: ChipVariant = ChipVariant {
    family: ChipFamily::Phoenix,
    name: "GTx3",
    format: ImageFormat::Legacy,
    layout: LEGACY_X5,
    version_addr: 0x8240,
    info_len: 12,
    cfg_reg: Some(0x8050),
    cmd_reg: Some(0x8040),
    cfg_flash_addr: Some(0x3E000),
    config_id_addr: None,
    decode: InfoDecode::Bcd,
    handshake: ConfigHandshake::Plain { wait_idle: false },
    protocol: Protocol::Classic,
    wide_addr: false,
    default_mask: 0x844,
    pid_compare_len: 4,
    hid_boundary: Some(0x0117),
    strict_cfg_check: true,
    coord_report_guard: false,
    pid7288_quirk: false,
};

static NORMANDY_L: ChipVariant = ChipVariant {
    family: ChipFamily::NormandyL,
    name: "GTx8",
    format: ImageFormat::Legacy,
    layout: LEGACY_X8,
    version_addr: 0x452C,
    info_len: 72,
    cfg_reg: Some(0x60DC),
    cmd_reg: Some(0x60CC),
    cfg_flash_addr: Some(0x1E000),
    config_id_addr: None,
    decode: InfoDecode::Block {
        pid_at: 9,
        sensor_at: 21,
        sensor_mask: 0x0F,
        major_at: 18,
        vid_at: 19,
        check: InfoCheck::Sum8Zero,
    },
    handshake: ConfigHandshake::Plain { wait_idle: true },
    protocol: Protocol::Classic,
    wide_addr: false,
    default_mask: 0x0C,
    pid_compare_len: 4,
    hid_boundary: None,
    strict_cfg_check: false,
    coord_report_guard: false,
    pid7288_quirk: false,
};

static YELLOWSTONE: ChipVariant = ChipVariant {
    family: ChipFamily::Yellowstone,
    name: "GT7868Q",
    format: ImageFormat::Legacy,
    layout: LEGACY_X8,
    version_addr: 0x4014,
    info_len: 32,
    cfg_reg: Some(0x96F8),
    cmd_reg: Some(0x4160),
    cfg_flash_addr: Some(0x19000),
    config_id_addr: None,
    decode: InfoDecode::Block {
        pid_at: 14,
        sensor_at: 27,
        sensor_mask: 0xFF,
        major_at: 23,
        vid_at: 24,
        check: InfoCheck::TailSum,
    },
    handshake: ConfigHandshake::Checksummed,
    protocol: Protocol::Classic,
    wide_addr: false,
    default_mask: 0x0C,
    pid_compare_len: 4,
    hid_boundary: None,
    strict_cfg_check: false,
    coord_report_guard: true,
    pid7288_quirk: false,
};

static BERLIN_A: ChipVariant = ChipVariant {
    family: ChipFamily::BerlinA,
    name: "BerlinA",
    format: ImageFormat::Structured,
    layout: STRUCTURED,
    version_addr: 0x1001E,
    info_len: 14,
    cfg_reg: None,
    cmd_reg: None,
    cfg_flash_addr: Some(0x40000),
    config_id_addr: Some(0x10076),
    decode: InfoDecode::Berlin,
    handshake: ConfigHandshake::Berlin,
    protocol: Protocol::Berlin,
    wide_addr: true,
    default_mask: 0,
    pid_compare_len: 8,
    hid_boundary: None,
    strict_cfg_check: false,
    coord_report_guard: false,
    pid7288_quirk: false,
};

static BERLIN_B: ChipVariant = ChipVariant {
    family: ChipFamily::BerlinB,
    name: "BerlinB",
    format: ImageFormat::Structured,
    layout: STRUCTURED,
    version_addr: 0x1001E,
    info_len: 14,
    cfg_reg: None,
    cmd_reg: None,
    cfg_flash_addr: Some(0x40000),
    config_id_addr: Some(0x10076),
    decode: InfoDecode::Berlin,
    handshake: ConfigHandshake::Berlin,
    protocol: Protocol::Berlin,
    wide_addr: true,
    default_mask: 0x0B,
    pid_compare_len: 8,
    hid_boundary: None,
    strict_cfg_check: false,
    coord_report_guard: false,
    pid7288_quirk: false,
};

impl ChipFamily {
    /// Static variant record for this family.
    pub fn variant(self) -> &'static ChipVariant {
        match self {
            ChipFamily::Mousepad => &MOUSEPAD,
            ChipFamily::Nanjing => &NANJING,
            ChipFamily::Phoenix => &PHOENIX,
            ChipFamily::NormandyL => &NORMANDY_L,
            ChipFamily::Yellowstone => &YELLOWSTONE,
            ChipFamily::BerlinA => &BERLIN_A,
            ChipFamily::BerlinB => &BERLIN_B,
        }
    }

    /// Match a 4-digit hex HID product id code (e.g. `"0EB3"`).
    pub fn from_pid_code(pid: &str) -> Option<ChipFamily> {
        let b: Vec<u8> = pid.bytes().map(|c| c.to_ascii_uppercase()).collect();
        if b.len() != 4 || !b.iter().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let hex = |c: u8| -> u8 {
            if c.is_ascii_digit() {
                c - b'0'
            } else {
                c - b'A' + 10
            }
        };
        let (d0, d1, d2, d3) = (hex(b[0]), hex(b[1]), hex(b[2]), hex(b[3]));
        let code = ((d0 as u16) << 12) | ((d1 as u16) << 8) | ((d2 as u16) << 4) | d3 as u16;
        match code {
            // 011x
            0x0110..=0x011F => Some(ChipFamily::Phoenix),
            // 01E0..01E7 (windows GT7863)
            0x01E0..=0x01E7 => Some(ChipFamily::NormandyL),
            // 01Fx
            0x01F0..=0x01FF => Some(ChipFamily::Mousepad),
            // 0Cxx
            0x0C00..=0x0CFF => Some(ChipFamily::BerlinB),
            // 0D00..0D7F (chrome GT7863), 0D80..0DBF (GT7868Q)
            0x0D00..=0x0D7F => Some(ChipFamily::NormandyL),
            0x0D80..=0x0DBF => Some(ChipFamily::Yellowstone),
            // 0EA5..0EAF, 0EBx, 0ECx
            0x0EA5..=0x0ECF => Some(ChipFamily::BerlinB),
            // remaining 0Exx
            0x0E00..=0x0EFF => Some(ChipFamily::Phoenix),
            // 0F60..0F7F
            0x0F60..=0x0F7F => Some(ChipFamily::BerlinA),
            // remaining 0Fxx
            0x0F00..=0x0FFF => Some(ChipFamily::Mousepad),
            _ => None,
        }
    }

    /// Match a product series name (e.g. `"7288"`, `"8589"`, `"9966"`).
    pub fn from_series(series: &str) -> Option<ChipFamily> {
        let b = series.as_bytes();
        if series.starts_with("7868") {
            return Some(ChipFamily::Yellowstone);
        }
        if series.starts_with("7726") {
            return Some(ChipFamily::BerlinA);
        }
        if b.len() < 4 || !b[0].is_ascii_digit() || !b[2].is_ascii_digit() || !b[3].is_ascii_digit()
        {
            return None;
        }
        match b[1] {
            b'2' => Some(ChipFamily::Mousepad),
            b'3' => Some(ChipFamily::Phoenix),
            b'5' => Some(ChipFamily::Nanjing),
            b'8' => Some(ChipFamily::NormandyL),
            b'9' => Some(ChipFamily::BerlinB),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.variant().name)
    }
}
