//! Linux i2c-dev device implementation
//!
//! Berlin controllers wired straight to an I2C bus take register
//! transactions without the HID bridge: a read is a 4-byte big-endian
//! address write followed by a read, a write prefixes each payload chunk
//! with its destination address. Transfers are kept to 16-byte packets,
//! the largest the controller's I2C slave engine accepts in one go.

use crate::error::{I2cError, Result};

use gtflash_core::error::TransportError;
use gtflash_core::packet::PRE_HEAD_LEN;
use gtflash_core::transport::Transport;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

/// Default 7-bit slave address of a Goodix touch controller.
pub const DEFAULT_SLAVE_ADDR: u16 = 0x14;

/// Controller-side command channel; protocol reports are delivered here
/// as checksummed frames since raw I2C has no feature reports.
const SPE_CMD_REG: u32 = 0x10174;

const ADDR_LEN: usize = 4;
const PACKET_LEN: usize = 16;
const MAX_CHUNK: usize = PACKET_LEN - ADDR_LEN;
const TRANSFER_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(5);

/// Linux i2c-dev ioctl constants
mod ioctl {
    use nix::ioctl_write_int_bad;

    /// I2C_SLAVE from linux/i2c-dev.h
    const I2C_SLAVE: libc::c_int = 0x0703;

    ioctl_write_int_bad!(i2c_slave, I2C_SLAVE);
}

/// Berlin touch controller behind a `/dev/i2c-N` node.
pub struct I2cDevice {
    file: File,
    path: String,
}

impl I2cDevice {
    /// Open an i2c-dev node and select the controller's slave address.
    pub fn open(path: &str, slave_addr: u16) -> Result<Self> {
        if slave_addr > 0x7F {
            return Err(I2cError::InvalidAddress(slave_addr));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| I2cError::OpenFailed {
                path: path.to_string(),
                source: e,
            })?;
        unsafe {
            ioctl::i2c_slave(file.as_raw_fd(), slave_addr as libc::c_int).map_err(|e| {
                I2cError::SetSlaveFailed {
                    addr: slave_addr,
                    source: e.into(),
                }
            })?;
        }
        log::info!("i2c: opened {path} (slave 0x{slave_addr:02X})");
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    /// Device path this handle was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn write_chunk(&mut self, addr: u32, chunk: &[u8]) -> std::result::Result<(), TransportError> {
        let mut frame = Vec::with_capacity(ADDR_LEN + chunk.len());
        frame.extend_from_slice(&addr.to_be_bytes());
        frame.extend_from_slice(chunk);

        let mut last = String::new();
        for attempt in 0..TRANSFER_RETRIES {
            match self.file.write(&frame) {
                Ok(n) if n == frame.len() => return Ok(()),
                Ok(n) => last = format!("short write: {n} of {} bytes", frame.len()),
                Err(e) => last = e.to_string(),
            }
            log::debug!(
                "i2c: write to 0x{addr:05X} retry {}: {last}",
                attempt + 1
            );
            thread::sleep(RETRY_DELAY);
        }
        Err(TransportError::Io(last))
    }

    fn read_chunk(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> std::result::Result<(), TransportError> {
        let mut last = String::new();
        for attempt in 0..TRANSFER_RETRIES {
            let set = self.file.write(&addr.to_be_bytes());
            match set {
                Ok(n) if n == ADDR_LEN => {}
                Ok(n) => {
                    last = format!("short address write: {n} bytes");
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
                Err(e) => {
                    last = e.to_string();
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
            }
            match self.file.read(buf) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => last = format!("short read: {n} of {} bytes", buf.len()),
                Err(e) => last = e.to_string(),
            }
            log::debug!("i2c: read of 0x{addr:05X} retry {}: {last}", attempt + 1);
            thread::sleep(RETRY_DELAY);
        }
        Err(TransportError::Io(last))
    }
}

impl Transport for I2cDevice {
    fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> std::result::Result<(), TransportError> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let take = (buf.len() - pos).min(MAX_CHUNK);
            let chunk_addr = addr + pos as u32;
            self.read_chunk(chunk_addr, &mut buf[pos..pos + take])?;
            pos += take;
        }
        Ok(())
    }

    fn write_regs(&mut self, addr: u32, data: &[u8]) -> std::result::Result<(), TransportError> {
        let mut pos = 0usize;
        while pos < data.len() {
            let take = (data.len() - pos).min(MAX_CHUNK);
            self.write_chunk(addr + pos as u32, &data[pos..pos + take])?;
            pos += take;
        }
        Ok(())
    }

    /// Translate a protocol report into the controller's command-channel
    /// frame: `{0, 0, len, cmd, data, cks16 LE}` at the special command
    /// register, which the firmware polls whether or not a HID bridge is
    /// present.
    fn send_report(&mut self, report: &[u8]) -> std::result::Result<(), TransportError> {
        if report.len() < PRE_HEAD_LEN + 1 {
            return Err(TransportError::PayloadTooLarge { len: report.len() });
        }
        let cmd = report[1];
        let data_len = report[4] as usize;
        let data = &report[PRE_HEAD_LEN..PRE_HEAD_LEN + data_len];

        let mut frame = Vec::with_capacity(data_len + 6);
        frame.push(0);
        frame.push(0);
        frame.push((data_len + 4) as u8);
        frame.push(cmd);
        frame.extend_from_slice(data);
        let cks: u16 = frame[2..].iter().map(|&b| b as u16).sum();
        frame.extend_from_slice(&cks.to_le_bytes());
        self.write_regs(SPE_CMD_REG, &frame)
    }

    fn is_open(&self) -> bool {
        self.file.as_raw_fd() >= 0
    }
}
