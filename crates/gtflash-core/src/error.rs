//! Error types for gtflash-core
//!
//! One enum per concern: image parsing, transport I/O, device property
//! reads, and the update engine. The engine error wraps the others so a
//! caller only ever matches on [`UpdateError`].

use thiserror::Error;

/// Firmware image parse/validation errors
///
/// All image errors are fatal and non-retryable: they are reported before
/// any device I/O happens.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Could not read the image file
    #[error("failed to read firmware file: {0}")]
    Io(#[from] std::io::Error),

    /// File too short to contain the declared header
    #[error("firmware file truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required by the layout
        need: usize,
        /// Bytes actually present
        have: usize,
    },

    /// Declared payload size does not line up with the file length
    #[error("firmware size mismatch: declared {declared} + header != file length {file_len}")]
    SizeMismatch {
        /// Size field from the header
        declared: usize,
        /// Actual file length
        file_len: usize,
    },

    /// Payload checksum does not match the header field
    #[error("firmware checksum mismatch: computed 0x{computed:08X}, expected 0x{expected:08X}")]
    ChecksumMismatch {
        /// Sum computed over the payload
        computed: u32,
        /// Sum declared in the header
        expected: u32,
    },

    /// Trailing config block length field disagrees with the file length
    #[error("config block size mismatch: declared {declared}, trailing region {trailing}")]
    ConfigSizeMismatch {
        /// Pack length from the config header
        declared: usize,
        /// Bytes actually trailing the firmware region
        trailing: usize,
    },

    /// Trailing config block checksum does not match
    #[error("config block checksum mismatch: computed 0x{computed:04X}, expected 0x{expected:04X}")]
    ConfigChecksumMismatch {
        /// Sum computed over the config data
        computed: u16,
        /// Sum declared in the config header
        expected: u16,
    },

    /// Subsystem count field exceeds the per-variant maximum
    #[error("invalid subsystem count {count} (max {max})")]
    TooManySubsystems {
        /// Count field from the header
        count: usize,
        /// Variant maximum
        max: usize,
    },

    /// Cumulative subsystem sizes run past the end of the payload
    #[error("subsystem {index} data (offset {offset}, len {len}) exceeds payload length {payload_len}")]
    SubsystemOverflow {
        /// Subsystem table index
        index: usize,
        /// Offset of the subsystem data within the blob
        offset: usize,
        /// Declared subsystem length
        len: usize,
        /// Total payload length
        payload_len: usize,
    },
}

/// Transport-level I/O errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Device file is not open
    #[error("device not open")]
    NotOpen,

    /// Underlying ioctl/syscall failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Feature report came back with the wrong report id
    #[error("unexpected report id 0x{got:02X}, expected 0x{expected:02X}")]
    BadReportId {
        /// Report id received
        got: u8,
        /// Report id requested
        expected: u8,
    },

    /// Read response carried an out-of-sequence package index
    #[error("package index mismatch: expected {expected}, got {got}")]
    PackageIndex {
        /// Index we were waiting for
        expected: u8,
        /// Index in the response
        got: u8,
    },

    /// Read response length field disagrees with the remaining transfer
    #[error("package length mismatch: reported {reported}, expected {expected}")]
    PackageLength {
        /// Length byte in the response
        reported: usize,
        /// Bytes still outstanding
        expected: usize,
    },

    /// A payload does not fit the report layout
    #[error("payload of {len} bytes does not fit report")]
    PayloadTooLarge {
        /// Offending payload length
        len: usize,
    },

    /// A status register never reached the expected sentinel
    #[error("register 0x{addr:05X} stuck at 0x{last:02X}, wanted 0x{want:02X}")]
    SentinelTimeout {
        /// Register polled
        addr: u32,
        /// Sentinel we waited for
        want: u8,
        /// Last value observed
        last: u8,
    },
}

/// Live device property read errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Transport failure while reading identity registers
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Retry budget exhausted without a coherent read
    #[error("device not ready: version registers unreadable after {attempts} attempts")]
    NotReady {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Firmware info block failed its embedded checksum
    #[error("firmware info block checksum error: residue 0x{residue:04X}")]
    InfoChecksum {
        /// Nonzero checksum residue
        residue: u16,
    },
}

/// Update engine errors
///
/// `AlreadyUpToDate` is a designed skip, not a failure; callers should
/// report it as success-with-no-action.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Engine used before transport and image were both ready
    #[error("update engine not initialized")]
    NotReady,

    /// Device PID does not match the image PID
    #[error("product mismatch: device {device:?}, image {image:?}")]
    ProductMismatch {
        /// PID read from the device
        device: String,
        /// PID parsed from the image
        image: String,
    },

    /// Device already runs the image version
    #[error("device firmware already up to date")]
    AlreadyUpToDate,

    /// Bootloader state register never reported ready
    #[error("bootloader not ready")]
    BootloaderNotReady,

    /// Image carries no subsystem data
    #[error("no firmware data in image")]
    NoFirmwareData,

    /// Mask excluded every subsystem in the image
    #[error("no subsystem matched the update mask")]
    NoEligibleSubsystem,

    /// Register write failed
    #[error("write failed: {0}")]
    WriteFailed(TransportError),

    /// Device rejected a flash chunk after all reload attempts
    #[error("flash chunk at 0x{addr:06X} rejected after {attempts} attempts")]
    ChunkVerifyFailed {
        /// Flash address of the failing chunk
        addr: u32,
        /// Reload attempts made
        attempts: u32,
    },

    /// No bundled config matches the device's sensor id
    #[error("no config matches sensor id {sensor_id}")]
    NoMatchingConfig {
        /// Sensor id reported by the device
        sensor_id: u8,
    },

    /// Device refused the interactive config handshake
    #[error("device rejected config (status 0x{status:02X})")]
    ConfigRejected {
        /// Last status byte observed
        status: u8,
    },

    /// Post-update version readback does not match the image
    #[error("post-update verification failed: device {device:#x}, image {image:#x}")]
    VerifyFailed {
        /// Version-minor composite on the device
        device: u32,
        /// Version-minor composite in the image
        image: u32,
    },

    /// Device identity could not be read
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Transport failure outside a retried step
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Run cancelled between chunks
    #[error("update cancelled")]
    Cancelled,
}
