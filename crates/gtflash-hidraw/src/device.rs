//! Linux hidraw device implementation
//!
//! This module provides the `HidrawDevice` struct that implements the
//! core `Transport` trait over `/dev/hidrawN` feature-report ioctls.

use crate::error::{HidrawError, Result};

use gtflash_core::error::TransportError;
use gtflash_core::packet::{PacketLayout, REPORT_ID};
use gtflash_core::transport::Transport;

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

/// Goodix HID vendor id
pub const GOODIX_VENDOR_ID: u16 = 0x27C6;

/// Retries for a failing set-feature ioctl
const FEATURE_RETRIES: u32 = 6;
const FEATURE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Restarts of a whole register read when a response report is out of
/// sequence
const READ_RESTARTS: u32 = 6;

/// Linux hidraw ioctl constants
mod ioctl {
    use nix::{ioctl_read, ioctl_readwrite_buf};

    const HID_IOC_MAGIC: u8 = b'H';
    const HID_IOC_GRAWINFO: u8 = 0x03;
    const HID_IOC_SFEATURE: u8 = 0x06;
    const HID_IOC_GFEATURE: u8 = 0x07;

    /// Kernel struct hidraw_devinfo
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct HidrawDevinfo {
        pub bustype: u32,
        pub vendor: i16,
        pub product: i16,
    }

    ioctl_read!(hidiocgrawinfo, HID_IOC_MAGIC, HID_IOC_GRAWINFO, HidrawDevinfo);
    ioctl_readwrite_buf!(hidiocsfeature, HID_IOC_MAGIC, HID_IOC_SFEATURE, u8);
    ioctl_readwrite_buf!(hidiocgfeature, HID_IOC_MAGIC, HID_IOC_GFEATURE, u8);
}

/// Identity reported by the kernel for a hidraw node.
#[derive(Debug, Clone, Copy)]
pub struct HidrawInfo {
    /// Bus type (USB, I2C, ...)
    pub bustype: u32,
    /// HID vendor id
    pub vendor: u16,
    /// HID product id
    pub product: u16,
}

impl HidrawInfo {
    /// Product id as the 4-digit uppercase hex code used for chip
    /// detection.
    pub fn product_code(&self) -> String {
        format!("{:04X}", self.product)
    }
}

/// Goodix touch controller behind a `/dev/hidrawN` node.
pub struct HidrawDevice {
    file: File,
    path: String,
    layout: PacketLayout,
    info: HidrawInfo,
}

impl HidrawDevice {
    /// Open a hidraw node and verify it belongs to a Goodix controller.
    pub fn open(path: &str, layout: PacketLayout) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| HidrawError::OpenFailed {
                path: path.to_string(),
                source: e,
            })?;

        let mut raw = ioctl::HidrawDevinfo::default();
        unsafe {
            ioctl::hidiocgrawinfo(file.as_raw_fd(), &mut raw)
                .map_err(|e| HidrawError::InfoFailed(e.into()))?;
        }
        let info = HidrawInfo {
            bustype: raw.bustype,
            vendor: raw.vendor as u16,
            product: raw.product as u16,
        };
        if info.vendor != GOODIX_VENDOR_ID {
            return Err(HidrawError::NotGoodix {
                path: path.to_string(),
                vendor: info.vendor,
            });
        }
        log::info!(
            "hidraw: opened {} (vendor {:04X}, product {})",
            path,
            info.vendor,
            info.product_code()
        );

        Ok(Self {
            file,
            path: path.to_string(),
            layout,
            info,
        })
    }

    /// Kernel-reported identity of this node.
    pub fn info(&self) -> HidrawInfo {
        self.info
    }

    /// Replace the wire layout. The right layout is only known once the
    /// product code has identified the chip family, after open.
    pub fn set_layout(&mut self, layout: PacketLayout) {
        self.layout = layout;
    }

    /// Device path this handle was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Send one feature report, retrying a few times; controllers drop
    /// the occasional report while busy with touch processing.
    fn set_feature(&mut self, report: &[u8]) -> std::result::Result<(), TransportError> {
        let fd = self.file.as_raw_fd();
        let mut buf = report.to_vec();
        buf.resize(self.layout.report_size, 0);
        buf[0] = REPORT_ID;

        let mut last = nix::errno::Errno::EIO;
        for attempt in 0..FEATURE_RETRIES {
            match unsafe { ioctl::hidiocsfeature(fd, &mut buf) } {
                Ok(_) => return Ok(()),
                Err(e) => {
                    log::debug!(
                        "hidraw: set-feature attempt {} failed: {e}",
                        attempt + 1
                    );
                    last = e;
                }
            }
            thread::sleep(FEATURE_RETRY_DELAY);
        }
        Err(TransportError::Io(format!("set-feature failed: {last}")))
    }

    /// Fetch one feature report of the layout's report size.
    fn get_feature(&mut self) -> std::result::Result<Vec<u8>, TransportError> {
        let fd = self.file.as_raw_fd();
        let mut buf = vec![0u8; self.layout.report_size];
        buf[0] = REPORT_ID;
        unsafe {
            ioctl::hidiocgfeature(fd, &mut buf)
                .map_err(|e| TransportError::Io(format!("get-feature failed: {e}")))?;
        }
        Ok(buf)
    }

    fn read_regs_once(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> std::result::Result<(), TransportError> {
        let request = self.layout.encode_read_request(addr, buf.len());
        self.set_feature(&request)?;

        let mut pos = 0usize;
        let mut index = 0u8;
        while pos < buf.len() {
            let report = self.get_feature()?;
            let chunk = self
                .layout
                .parse_read_response(&report, index, buf.len() - pos)?;
            if chunk.is_empty() {
                return Err(TransportError::PackageLength {
                    reported: 0,
                    expected: buf.len() - pos,
                });
            }
            buf[pos..pos + chunk.len()].copy_from_slice(chunk);
            pos += chunk.len();
            index = index.wrapping_add(1);
        }
        Ok(())
    }
}

impl Transport for HidrawDevice {
    /// Register reads restart from the read request whenever a response
    /// arrives out of sequence; the controller keeps no read cursor we
    /// could resynchronize with.
    fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> std::result::Result<(), TransportError> {
        let mut last = TransportError::NotOpen;
        for attempt in 0..READ_RESTARTS {
            match self.read_regs_once(addr, buf) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!(
                        "hidraw: read of 0x{addr:05X} restarted (attempt {}): {e}",
                        attempt + 1
                    );
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn write_regs(&mut self, addr: u32, data: &[u8]) -> std::result::Result<(), TransportError> {
        for packet in self.layout.encode_write_packets(addr, data) {
            self.set_feature(&packet)?;
        }
        Ok(())
    }

    fn send_report(&mut self, report: &[u8]) -> std::result::Result<(), TransportError> {
        self.set_feature(report)
    }

    fn is_open(&self) -> bool {
        self.file.as_raw_fd() >= 0
    }
}
