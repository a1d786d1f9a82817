//! Device transport abstraction
//!
//! The update engine talks to a controller through this trait; hidraw
//! and i2c-dev implementations live in their own crates, and the dummy
//! crate provides an in-memory emulation for tests and dry runs.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::TransportError;

/// Register-level access to a live controller.
///
/// `read_regs`/`write_regs` address the controller's register space and
/// handle any wire chunking internally. `send_report` delivers a raw
/// protocol report (mode switch, start update, restart); implementations
/// force the report id into byte 0.
pub trait Transport {
    /// Read `buf.len()` bytes starting at register `addr`.
    fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Write `data` starting at register `addr`.
    fn write_regs(&mut self, addr: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Deliver a raw protocol report.
    fn send_report(&mut self, report: &[u8]) -> Result<(), TransportError>;

    /// Whether the underlying device handle is usable.
    fn is_open(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_regs(addr, buf)
    }

    fn write_regs(&mut self, addr: u32, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_regs(addr, data)
    }

    fn send_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        (**self).send_report(report)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_regs(addr, buf)
    }

    fn write_regs(&mut self, addr: u32, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_regs(addr, data)
    }

    fn send_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        (**self).send_report(report)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Poll a single status register until it reads `want`.
///
/// Transient read failures count as a miss rather than aborting; the
/// device is often mid-reset while we poll. Returns
/// [`TransportError::SentinelTimeout`] with the last value observed once
/// `attempts` are exhausted.
pub fn poll_reg<T: Transport + ?Sized>(
    t: &mut T,
    addr: u32,
    want: u8,
    attempts: u32,
    interval: Duration,
) -> Result<(), TransportError> {
    let mut last = 0u8;
    for _ in 0..attempts {
        let mut val = [0u8];
        match t.read_regs(addr, &mut val) {
            Ok(()) => {
                last = val[0];
                if last == want {
                    return Ok(());
                }
                debug!(
                    "reg 0x{addr:05X} is 0x{last:02X}, waiting for 0x{want:02X}"
                );
            }
            Err(e) => debug!("poll read of 0x{addr:05X} failed: {e}"),
        }
        thread::sleep(interval);
    }
    Err(TransportError::SentinelTimeout { addr, want, last })
}
