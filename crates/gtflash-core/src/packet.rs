//! HID feature-report register transaction codec
//!
//! Register access rides on feature reports with a fixed pre-header
//! `{report_id, cmd, follow_flag, package_index, data_len}` and a data
//! header `{rw_flag, addr, len}`. Classic parts use 16-bit register
//! addresses, Berlin parts 32-bit. Everything here is pure byte
//! shuffling so the codec is testable without a device.

use crate::error::TransportError;

/// Feature report id used for all register traffic.
pub const REPORT_ID: u8 = 0x0E;
/// Direct register read/write command.
pub const CMD_I2C_DIRECT_RW: u8 = 0x20;

/// Bytes before the payload in a protocol command report:
/// `{report_id, cmd, continuation, index, data_len}`.
pub const PRE_HEAD_LEN: usize = 5;
const READ_FLAG: u8 = 1;
const WRITE_FLAG: u8 = 0;

/// Wire layout parameters for one protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    /// Feature report size including the report id byte
    pub report_size: usize,
    /// Register address width in bytes (2 classic, 4 Berlin)
    pub addr_width: usize,
}

impl PacketLayout {
    /// 65-byte reports, 16-bit addresses.
    pub const CLASSIC: PacketLayout = PacketLayout {
        report_size: 65,
        addr_width: 2,
    };

    /// 65-byte reports, 32-bit addresses.
    pub const BERLIN: PacketLayout = PacketLayout {
        report_size: 65,
        addr_width: 4,
    };

    /// Total header bytes before the payload.
    pub fn header_len(&self) -> usize {
        PRE_HEAD_LEN + 1 + self.addr_width + 2
    }

    /// Payload bytes that fit one report.
    pub fn max_payload(&self) -> usize {
        self.report_size - self.header_len()
    }

    fn put_addr_len(&self, buf: &mut Vec<u8>, addr: u32, len: usize) {
        if self.addr_width == 4 {
            buf.extend_from_slice(&addr.to_be_bytes());
        } else {
            buf.extend_from_slice(&(addr as u16).to_be_bytes());
        }
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    }

    /// Build a read request for `len` bytes starting at `addr`.
    pub fn encode_read_request(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len());
        buf.push(REPORT_ID);
        buf.push(CMD_I2C_DIRECT_RW);
        buf.push(0);
        buf.push(0);
        buf.push((1 + self.addr_width + 2) as u8);
        buf.push(READ_FLAG);
        self.put_addr_len(&mut buf, addr, len);
        buf
    }

    /// Split `data` into write packets with the follow-up flag and an
    /// incrementing package index.
    pub fn encode_write_packets(&self, addr: u32, data: &[u8]) -> Vec<Vec<u8>> {
        let chunk_len = self.max_payload();
        let mut packets = Vec::new();
        let mut pos = 0usize;
        let mut current_addr = addr;
        let mut index = 0u8;
        while pos < data.len() {
            let take = (data.len() - pos).min(chunk_len);
            let follow = pos + take < data.len();
            let mut buf = Vec::with_capacity(self.header_len() + take);
            buf.push(REPORT_ID);
            buf.push(CMD_I2C_DIRECT_RW);
            buf.push(follow as u8);
            buf.push(index);
            buf.push((take + 1 + self.addr_width + 2) as u8);
            buf.push(WRITE_FLAG);
            self.put_addr_len(&mut buf, current_addr, take);
            buf.extend_from_slice(&data[pos..pos + take]);
            packets.push(buf);
            pos += take;
            current_addr += take as u32;
            index = index.wrapping_add(1);
        }
        packets
    }

    /// Build a protocol command report: `{report_id, cmd, 0, 0, len, data}`.
    pub fn encode_cmd_report(&self, cmd: u8, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        if data.len() > self.report_size - PRE_HEAD_LEN {
            return Err(TransportError::PayloadTooLarge { len: data.len() });
        }
        let mut buf = Vec::with_capacity(PRE_HEAD_LEN + data.len());
        buf.push(REPORT_ID);
        buf.push(cmd);
        buf.push(0);
        buf.push(0);
        buf.push(data.len() as u8);
        buf.extend_from_slice(data);
        Ok(buf)
    }

    /// Validate one read-response report and return its payload.
    ///
    /// The device answers a read request with a sequence of reports:
    /// byte 3 carries the package index, byte 4 the number of data bytes
    /// still outstanding in this report, data at byte 5. Any index or
    /// length disagreement means the transfer must be restarted from the
    /// read request.
    pub fn parse_read_response<'r>(
        &self,
        report: &'r [u8],
        expected_index: u8,
        remaining: usize,
    ) -> Result<&'r [u8], TransportError> {
        if report.len() < PRE_HEAD_LEN + 1 {
            return Err(TransportError::PackageLength {
                reported: report.len(),
                expected: PRE_HEAD_LEN + 1,
            });
        }
        if report[0] != REPORT_ID {
            return Err(TransportError::BadReportId {
                got: report[0],
                expected: REPORT_ID,
            });
        }
        if report[3] != expected_index {
            return Err(TransportError::PackageIndex {
                expected: expected_index,
                got: report[3],
            });
        }
        let chunk = report[4] as usize;
        let avail = report.len() - PRE_HEAD_LEN;
        if chunk > remaining.min(avail) {
            return Err(TransportError::PackageLength {
                reported: chunk,
                expected: remaining.min(avail),
            });
        }
        Ok(&report[PRE_HEAD_LEN..PRE_HEAD_LEN + chunk])
    }
}
