//! gtflash-dummy - In-memory touch controller emulator
//!
//! This crate provides an emulated Goodix touch controller behind the
//! core `Transport` trait. It honors the mode-switch, load-flash, and
//! restart protocol of the real parts (acking only chunks whose
//! announced checksum matches the staged data), emulates the
//! interactive config handshakes, and keeps a record of everything that
//! was "flashed". Useful for dry runs and end-to-end tests without
//! hardware.

#![warn(missing_docs)]

use std::collections::{BTreeMap, HashMap};

use gtflash_core::checksum::{sum8, sum16_be, sum16_le_u32};
use gtflash_core::chip::{
    ChipFamily, ChipVariant, ConfigHandshake, InfoCheck, InfoDecode, Protocol,
};
use gtflash_core::error::TransportError;
use gtflash_core::transport::Transport;

const CLASSIC_BOOT_STATE: u32 = 0x5095;
const CLASSIC_LOAD_STATE: u32 = 0x5096;
const CLASSIC_STAGING: u32 = 0xC000;
const BERLIN_BOOT_STATE: u32 = 0x10010;
const BERLIN_LOAD_STATE: u32 = 0x10011;
const BERLIN_STAGING: u32 = 0x14000;
const BERLIN_SPE_CMD: u32 = 0x10174;
const BERLIN_CFG_BUFFER: u32 = 0x13B74;
const BERLIN_IDENT: u32 = 0x1001E;
const BERLIN_CFG_ID: u32 = 0x10076;

/// Identity the emulated controller reports.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Product id string
    pub pid: String,
    /// Major version byte (BCD for GTx3/GTx5)
    pub major: u8,
    /// Two high minor bytes
    pub minor: [u8; 2],
    /// Config version byte
    pub cfg_version: u8,
    /// Sensor id
    pub sensor_id: u8,
}

/// Emulated touch controller.
pub struct EmulatedIc {
    variant: &'static ChipVariant,
    regs: HashMap<u32, Vec<u8>>,
    staging: Vec<u8>,
    flashed: BTreeMap<u32, Vec<u8>>,
    downloaded_config: Option<Vec<u8>>,
    resets: u32,
    post_update: Option<Identity>,
}

impl EmulatedIc {
    /// Build an emulated controller of the given family with a default
    /// identity.
    pub fn new(family: ChipFamily) -> Self {
        let mut ic = EmulatedIc {
            variant: family.variant(),
            regs: HashMap::new(),
            staging: Vec::new(),
            flashed: BTreeMap::new(),
            downloaded_config: None,
            resets: 0,
            post_update: None,
        };
        ic.seed_identity(&Identity {
            pid: default_pid(family).to_string(),
            major: 1,
            minor: [0, 1],
            cfg_version: 1,
            sensor_id: 1,
        });
        if let Some(cmd_reg) = ic.variant.cmd_reg {
            // config command channel idles at 0xFF
            ic.regs.insert(cmd_reg, vec![0xFF; 5]);
        }
        ic
    }

    /// Replace the reported identity.
    pub fn with_identity(mut self, ident: Identity) -> Self {
        self.seed_identity(&ident);
        self
    }

    /// Identity to report after the next restart, emulating a firmware
    /// that actually took.
    pub fn after_update(mut self, ident: Identity) -> Self {
        self.post_update = Some(ident);
        self
    }

    /// Bytes flashed contiguously starting at `base`.
    pub fn flashed(&self, base: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut next = base;
        for (&addr, data) in self.flashed.range(base..) {
            if addr != next {
                break;
            }
            out.extend_from_slice(data);
            next = addr + data.len() as u32;
        }
        out
    }

    /// Config delivered through the interactive handshake, if any.
    pub fn downloaded_config(&self) -> Option<&[u8]> {
        self.downloaded_config.as_deref()
    }

    /// Number of restart commands seen.
    pub fn reset_count(&self) -> u32 {
        self.resets
    }

    fn seed_identity(&mut self, ident: &Identity) {
        match self.variant.decode {
            InfoDecode::Bcd => {
                let mut info = vec![0u8; self.variant.info_len];
                let pid = ident.pid.as_bytes();
                info[..pid.len().min(4)].copy_from_slice(&pid[..pid.len().min(4)]);
                info[5] = ident.major;
                info[6] = ident.minor[0];
                info[10] = ident.sensor_id;
                self.regs.insert(self.variant.version_addr, info);
            }
            InfoDecode::Block {
                pid_at,
                sensor_at,
                major_at,
                vid_at,
                check,
                ..
            } => {
                let mut info = vec![0u8; self.variant.info_len];
                let pid = ident.pid.as_bytes();
                info[pid_at..pid_at + pid.len().min(4)]
                    .copy_from_slice(&pid[..pid.len().min(4)]);
                info[sensor_at] = ident.sensor_id;
                info[major_at] = ident.major;
                info[vid_at] = ident.minor[0];
                info[vid_at + 1] = ident.minor[1];
                match check {
                    InfoCheck::None => {}
                    InfoCheck::Sum8Zero => {
                        let n = info.len();
                        let sum = sum8(&info[..n - 1]) as u8;
                        info[n - 1] = 0u8.wrapping_sub(sum);
                    }
                    InfoCheck::TailSum => {
                        let n = info.len();
                        let cks = sum8(&info[..n - 2]);
                        info[n - 2..].copy_from_slice(&cks.to_be_bytes());
                    }
                }
                self.regs.insert(self.variant.version_addr, info);
                if let Some(cfg_reg) = self.variant.cfg_reg {
                    // 3-byte version block with a zero sum
                    let residue = 0u8.wrapping_sub(ident.cfg_version);
                    self.regs
                        .insert(cfg_reg, vec![ident.cfg_version, 0, residue]);
                }
            }
            InfoDecode::Berlin => {
                let mut ident_block = vec![0u8; self.variant.info_len];
                let pid = ident.pid.as_bytes();
                ident_block[..pid.len().min(8)].copy_from_slice(&pid[..pid.len().min(8)]);
                ident_block[10] = ident.minor[0];
                ident_block[11] = ident.minor[1];
                ident_block[13] = ident.sensor_id;
                self.regs.insert(BERLIN_IDENT, ident_block);
                self.regs
                    .insert(BERLIN_CFG_ID, vec![0x01, 0x00, 0x00, 0x00, ident.cfg_version]);
            }
        }
    }

    fn staging_addr(&self) -> u32 {
        match self.variant.protocol {
            Protocol::Classic => CLASSIC_STAGING,
            Protocol::Berlin => BERLIN_STAGING,
        }
    }

    fn set_reg(&mut self, addr: u32, val: u8) {
        self.regs.insert(addr, vec![val]);
    }

    fn restart(&mut self) {
        self.resets += 1;
        if let Some(ident) = self.post_update.take() {
            self.seed_identity(&ident);
        }
    }

    fn handle_load(&mut self, report: &[u8]) {
        let (len, addr, ok) = match self.variant.protocol {
            Protocol::Classic => {
                let len = u16::from_be_bytes([report[5], report[6]]) as usize;
                let addr = ((report[7] as u32) << 16) | ((report[8] as u32) << 8);
                let cks = u16::from_be_bytes([report[9], report[10]]);
                (len, addr, cks == sum16_be(&self.staging))
            }
            Protocol::Berlin => {
                let len = u16::from_be_bytes([report[5], report[6]]) as usize;
                let addr =
                    u32::from_be_bytes([report[7], report[8], report[9], report[10]]);
                let cks =
                    u32::from_be_bytes([report[11], report[12], report[13], report[14]]);
                (len, addr, cks == sum16_le_u32(&self.staging))
            }
        };
        let state_reg = match self.variant.protocol {
            Protocol::Classic => CLASSIC_LOAD_STATE,
            Protocol::Berlin => BERLIN_LOAD_STATE,
        };
        if ok && len == self.staging.len() {
            self.flashed.insert(addr, self.staging.clone());
            self.set_reg(state_reg, 0xAA);
        } else {
            log::debug!("emulated ic: rejecting chunk at 0x{addr:06X}");
            self.set_reg(state_reg, 0x33);
        }
    }

    fn handle_cfg_cmd(&mut self, cmd_reg: u32, data: &[u8]) {
        match self.variant.handshake {
            ConfigHandshake::Plain { .. } => {
                if data == [0x80, 0x00, 0x80] {
                    self.set_reg(cmd_reg, 0x82);
                } else if data == [0x83] {
                    if let Some(cfg_reg) = self.variant.cfg_reg {
                        self.downloaded_config = self.regs.get(&cfg_reg).cloned();
                    }
                    self.set_reg(cmd_reg, 0xFF);
                }
            }
            ConfigHandshake::Checksummed => match data.first() {
                Some(0x80) => self.set_reg(cmd_reg, 0x82),
                Some(0x83) => {
                    if let Some(cfg_reg) = self.variant.cfg_reg {
                        self.downloaded_config = self.regs.get(&cfg_reg).cloned();
                    }
                    self.regs.insert(cmd_reg, vec![0x7F, 0, 0, 0, 0]);
                }
                Some(0x7D) => {
                    self.regs.insert(cmd_reg, vec![0xFF; 5]);
                }
                _ => {}
            },
            _ => {}
        }
    }
}

impl Transport for EmulatedIc {
    fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TransportError> {
        if addr == self.staging_addr() && buf.len() <= self.staging.len() {
            buf.copy_from_slice(&self.staging[..buf.len()]);
            return Ok(());
        }
        let data = self.regs.entry(addr).or_insert_with(|| vec![0; buf.len()]);
        if data.len() < buf.len() {
            data.resize(buf.len(), 0);
        }
        buf.copy_from_slice(&data[..buf.len()]);
        Ok(())
    }

    fn write_regs(&mut self, addr: u32, data: &[u8]) -> Result<(), TransportError> {
        if addr == self.staging_addr() {
            self.staging = data.to_vec();
            return Ok(());
        }
        if addr == BERLIN_SPE_CMD && self.variant.protocol == Protocol::Berlin {
            // frame: {0, 0, len, cmd, data, cks}; apply command commits
            // the staged config
            if data.len() >= 4 && data[3] == 0x05 {
                self.downloaded_config = self.regs.get(&BERLIN_CFG_BUFFER).cloned();
            }
            self.regs.insert(BERLIN_SPE_CMD, vec![0x80, 0x80]);
            return Ok(());
        }
        if Some(addr) == self.variant.cmd_reg {
            self.handle_cfg_cmd(addr, data);
            return Ok(());
        }
        self.regs.insert(addr, data.to_vec());
        Ok(())
    }

    fn send_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let boot_state = match self.variant.protocol {
            Protocol::Classic => CLASSIC_BOOT_STATE,
            Protocol::Berlin => BERLIN_BOOT_STATE,
        };
        match report[1] {
            0x10 => self.set_reg(boot_state, 0xDD),
            0x11 => {}
            0x12 => self.handle_load(report),
            0x13 => self.restart(),
            other => log::debug!("emulated ic: ignoring report 0x{other:02X}"),
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

fn default_pid(family: ChipFamily) -> &'static str {
    match family {
        ChipFamily::Mousepad => "7288",
        ChipFamily::Nanjing => "8589",
        ChipFamily::Phoenix => "7388",
        ChipFamily::NormandyL => "7863",
        ChipFamily::Yellowstone => "7868Q",
        ChipFamily::BerlinA => "7726",
        ChipFamily::BerlinB => "9966",
    }
}
