//! Minisystem flash protocol for Berlin parts
//!
//! Berlin controllers take 32-bit register addresses and stage chunks
//! through a buffer at 0x14000. Protocol commands are feature reports;
//! the special command channel at 0x10174 carries checksummed frames
//! for config download.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::checksum::sum16_le_u32;
use crate::device::DeviceProperties;
use crate::error::{TransportError, UpdateError};
use crate::image::{ConfigBlock, FirmwareImage};
use crate::packet::PacketLayout;
use crate::transport::{poll_reg, Transport};
use crate::update::CancelToken;

const CMD_SWITCH_TO_MINISYSTEM: u8 = 0x10;
const CMD_ERASE_FLASH: u8 = 0x11;
const CMD_LOAD_FLASH: u8 = 0x12;
const CMD_RESTART: u8 = 0x13;

const BOOT_STATE_REG: u32 = 0x10010;
const LOAD_STATE_REG: u32 = 0x10011;
const STAGING_BUFFER: u32 = 0x14000;
const SPE_CMD_REG: u32 = 0x10174;
const CFG_BUFFER: u32 = 0x13B74;
const CFG_FLASH_ADDR: u32 = 0x40000;
const CHUNK_LEN: usize = 4096;

const BOOT_READY: u8 = 0xDD;
const LOAD_ACK: u8 = 0xAA;
const LOAD_RETRIES: u32 = 3;

const SPE_CFG_PREPARE: u8 = 0x04;
const SPE_CFG_APPLY: u8 = 0x05;
const SPE_CFG_END: u8 = 0x06;

/// Switch into the minisystem bootloader, erase, and prove the staging
/// RAM is writable before any firmware goes through it.
pub(super) fn enter_minisystem<T: Transport + ?Sized>(t: &mut T) -> Result<(), UpdateError> {
    let mut ready = false;
    for attempt in 0..3 {
        let report =
            PacketLayout::BERLIN.encode_cmd_report(CMD_SWITCH_TO_MINISYSTEM, &[1])?;
        t.send_report(&report)?;
        thread::sleep(Duration::from_millis(200));
        let mut state = [0u8];
        match t.read_regs(BOOT_STATE_REG, &mut state) {
            Ok(()) if state[0] == BOOT_READY => {
                ready = true;
                break;
            }
            Ok(()) => debug!(
                "minisystem not up yet (attempt {}, state 0x{:02X})",
                attempt + 1,
                state[0]
            ),
            Err(e) => debug!("minisystem state read failed: {e}"),
        }
    }
    if !ready {
        return Err(UpdateError::BootloaderNotReady);
    }

    let report = PacketLayout::BERLIN.encode_cmd_report(CMD_ERASE_FLASH, &[1])?;
    t.send_report(&report)?;

    let pattern = [0x55u8; 5];
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(10));
        if t.write_regs(STAGING_BUFFER, &pattern).is_err() {
            continue;
        }
        let mut back = [0u8; 5];
        if t.read_regs(STAGING_BUFFER, &mut back).is_ok() && back == pattern {
            return Ok(());
        }
    }
    Err(UpdateError::BootloaderNotReady)
}

/// Flash the config (first, when bundled) and every firmware subsystem
/// past the bootloader entry.
pub(super) fn flash_all<T: Transport + ?Sized>(
    t: &mut T,
    image: &FirmwareImage,
    cancel: &CancelToken,
) -> Result<(), UpdateError> {
    let mut stages: Vec<(u32, &[u8])> = Vec::new();
    if let Some(ConfigBlock::Whole { data, .. }) = image.config() {
        stages.push((CFG_FLASH_ADDR, image.bytes(data.clone())));
    }
    // subsystem 0 is the bootloader itself and is never reflashed
    for sub in image.subsystems().iter().skip(1) {
        stages.push((sub.flash_addr, image.subsystem_data(sub)));
    }
    if stages.is_empty() {
        return Err(UpdateError::NoFirmwareData);
    }

    for (addr, data) in stages {
        info!("flashing 0x{:06X} ({} bytes)", addr, data.len());
        load_stage(t, addr, data, cancel)?;
    }
    Ok(())
}

fn load_stage<T: Transport + ?Sized>(
    t: &mut T,
    flash_addr: u32,
    data: &[u8],
    cancel: &CancelToken,
) -> Result<(), UpdateError> {
    for (i, chunk) in data.chunks(CHUNK_LEN).enumerate() {
        cancel.check()?;
        let addr = flash_addr + (i * CHUNK_LEN) as u32;
        let mut attempts = 0u32;
        loop {
            t.write_regs(STAGING_BUFFER, chunk)
                .map_err(UpdateError::WriteFailed)?;

            let cks = sum16_le_u32(chunk);
            let mut payload = [0u8; 10];
            payload[0..2].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            payload[2..6].copy_from_slice(&addr.to_be_bytes());
            payload[6..10].copy_from_slice(&cks.to_be_bytes());
            let report = PacketLayout::BERLIN.encode_cmd_report(CMD_LOAD_FLASH, &payload)?;
            t.send_report(&report)?;

            match poll_reg(t, LOAD_STATE_REG, LOAD_ACK, 10, Duration::from_millis(20)) {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    debug!("chunk at 0x{addr:06X} not acked (attempt {attempts}): {e}");
                    if attempts >= LOAD_RETRIES {
                        return Err(UpdateError::ChunkVerifyFailed { addr, attempts });
                    }
                }
            }
        }
    }
    Ok(())
}

pub(super) fn restart<T: Transport + ?Sized>(t: &mut T) -> Result<(), UpdateError> {
    let report = PacketLayout::BERLIN.encode_cmd_report(CMD_RESTART, &[1])?;
    t.send_report(&report)?;
    thread::sleep(Duration::from_millis(100));
    Ok(())
}

/// One full bootloader session: enter the minisystem, flash, restart.
/// The restart is issued on failure too, so the controller never stays
/// in the minisystem.
pub(super) fn flash_session<T: Transport + ?Sized>(
    t: &mut T,
    image: &FirmwareImage,
    cancel: &CancelToken,
) -> Result<(), UpdateError> {
    let result = (|| {
        enter_minisystem(t)?;
        flash_all(t, image, cancel)
    })();
    match result {
        Ok(()) => restart(t),
        Err(e) => {
            if let Err(re) = restart(t) {
                debug!("restart after a failed flash dropped: {re}");
            }
            Err(e)
        }
    }
}

/// Compare the post-restart version against the image. Images without a
/// bundled config keep whatever config version the device reports.
pub(super) fn verify(
    props: &DeviceProperties,
    image: &FirmwareImage,
) -> Result<(), UpdateError> {
    let mut want = image.version_minor();
    if !image.has_config() {
        want = (want & 0xFFFF_FF00) | (props.version_minor & 0xFF);
    }
    if props.version_minor != want {
        return Err(UpdateError::VerifyFailed {
            device: props.version_minor,
            image: want,
        });
    }
    Ok(())
}

/// Interactive config download over the special command channel: stage
/// the config, read it back, and only then tell the firmware to apply
/// it. The end frame is sent regardless of the outcome.
pub(super) fn send_config<T: Transport + ?Sized>(
    t: &mut T,
    image: &FirmwareImage,
) -> Result<(), UpdateError> {
    let data = match image.config() {
        Some(ConfigBlock::Whole { data, .. }) => image.bytes(data.clone()),
        _ => return Err(UpdateError::NoFirmwareData),
    };

    spe_cmd(t, &[SPE_CFG_PREPARE])?;
    let result = (|| {
        t.write_regs(CFG_BUFFER, data)
            .map_err(UpdateError::WriteFailed)?;
        let mut back = vec![0u8; data.len()];
        t.read_regs(CFG_BUFFER, &mut back)?;
        if back != data {
            return Err(UpdateError::ConfigRejected { status: 0 });
        }
        spe_cmd(t, &[SPE_CFG_APPLY])
    })();
    if let Err(e) = spe_cmd(t, &[SPE_CFG_END]) {
        debug!("config end command dropped: {e}");
    }
    result
}

/// Write one special command frame `{0, 0, len+3, payload, cks16 LE}`
/// and wait for the 0x80 0x80 ack.
fn spe_cmd<T: Transport + ?Sized>(t: &mut T, payload: &[u8]) -> Result<(), UpdateError> {
    if payload.len() > 11 {
        return Err(UpdateError::Transport(TransportError::PayloadTooLarge {
            len: payload.len(),
        }));
    }
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(0);
    frame.push(0);
    frame.push((payload.len() + 3) as u8);
    frame.extend_from_slice(payload);
    let cks: u16 = frame[2..].iter().map(|&b| b as u16).sum();
    frame.extend_from_slice(&cks.to_le_bytes());
    t.write_regs(SPE_CMD_REG, &frame)
        .map_err(UpdateError::WriteFailed)?;

    let mut last = 0u8;
    for _ in 0..20 {
        let mut ack = [0u8; 2];
        match t.read_regs(SPE_CMD_REG, &mut ack) {
            Ok(()) if ack == [0x80, 0x80] => {
                thread::sleep(Duration::from_millis(5));
                return Ok(());
            }
            Ok(()) => last = ack[0],
            Err(e) => debug!("special command ack read failed: {e}"),
        }
        thread::sleep(Duration::from_millis(15));
    }
    Err(UpdateError::Transport(TransportError::SentinelTimeout {
        addr: SPE_CMD_REG,
        want: 0x80,
        last,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipFamily;
    use crate::image::structured_testutil::StructuredImageBuilder;
    use std::collections::HashMap;

    struct EmuMinisystem {
        regs: HashMap<u32, Vec<u8>>,
        staging: Vec<u8>,
        flashed: Vec<(u32, Vec<u8>)>,
        resets: u32,
        reject_loads: u32,
        spe_frames: Vec<Vec<u8>>,
        corrupt_cfg_readback: bool,
    }

    impl EmuMinisystem {
        fn new() -> Self {
            EmuMinisystem {
                regs: HashMap::new(),
                staging: Vec::new(),
                flashed: Vec::new(),
                resets: 0,
                reject_loads: 0,
                spe_frames: Vec::new(),
                corrupt_cfg_readback: false,
            }
        }

        fn set_reg(&mut self, addr: u32, val: u8) {
            self.regs.insert(addr, vec![val]);
        }
    }

    impl Transport for EmuMinisystem {
        fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TransportError> {
            if addr == STAGING_BUFFER {
                buf.copy_from_slice(&self.staging[..buf.len()]);
                return Ok(());
            }
            if addr == CFG_BUFFER && self.corrupt_cfg_readback {
                buf.fill(0xEE);
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
            if addr == STAGING_BUFFER {
                self.staging = data.to_vec();
                return Ok(());
            }
            if addr == SPE_CMD_REG {
                self.spe_frames.push(data.to_vec());
                self.regs.insert(SPE_CMD_REG, vec![0x80, 0x80]);
                return Ok(());
            }
            self.regs.insert(addr, data.to_vec());
            Ok(())
        }

        fn send_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
            match report[1] {
                CMD_SWITCH_TO_MINISYSTEM => self.set_reg(BOOT_STATE_REG, BOOT_READY),
                CMD_ERASE_FLASH => {}
                CMD_LOAD_FLASH => {
                    if self.reject_loads > 0 {
                        self.reject_loads -= 1;
                        self.set_reg(LOAD_STATE_REG, 0x00);
                        return Ok(());
                    }
                    let len = u16::from_be_bytes([report[5], report[6]]) as usize;
                    let addr = u32::from_be_bytes([
                        report[7], report[8], report[9], report[10],
                    ]);
                    let cks = u32::from_be_bytes([
                        report[11], report[12], report[13], report[14],
                    ]);
                    if len == self.staging.len() && cks == sum16_le_u32(&self.staging) {
                        self.flashed.push((addr, self.staging.clone()));
                        self.set_reg(LOAD_STATE_REG, LOAD_ACK);
                    } else {
                        self.set_reg(LOAD_STATE_REG, 0x00);
                    }
                }
                CMD_RESTART => self.resets += 1,
                _ => {}
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn berlin_image(with_config: bool) -> FirmwareImage {
        let variant = ChipFamily::BerlinB.variant();
        let mut b = StructuredImageBuilder::new()
            .pid("9966")
            .vid([0, 0, 0x01, 0x04])
            .subsystem(1, 0x0000, &[0xB0; 64])
            .subsystem(2, 0x2000, &[0x11; 5000])
            .subsystem(4, 0x30000, &[0x44; 200]);
        if with_config {
            b = b.config(&[0xCC; 300], 0x09);
        }
        FirmwareImage::parse(b.build(), variant).unwrap()
    }

    #[test]
    fn config_is_flashed_first_and_bootloader_is_skipped() {
        let image = berlin_image(true);
        let mut emu = EmuMinisystem::new();
        enter_minisystem(&mut emu).unwrap();
        flash_all(&mut emu, &image, &CancelToken::default()).unwrap();
        let addrs: Vec<u32> = emu.flashed.iter().map(|(a, _)| *a).collect();
        assert_eq!(addrs.first(), Some(&CFG_FLASH_ADDR));
        assert!(addrs.contains(&0x2000));
        assert!(addrs.contains(&0x30000));
        // bootloader subsystem at 0x0000 untouched
        assert!(!addrs.contains(&0x0000));
        // the 5000-byte stage splits into a 4096 and a 904 chunk
        assert!(addrs.contains(&(0x2000 + 4096)));
    }

    #[test]
    fn failed_flash_still_restarts_the_controller() {
        let image = berlin_image(true);
        let mut emu = EmuMinisystem::new();
        emu.reject_loads = u32::MAX;
        let err = flash_session(&mut emu, &image, &CancelToken::default()).unwrap_err();
        assert!(matches!(err, UpdateError::ChunkVerifyFailed { .. }));
        assert_eq!(emu.resets, 1);
    }

    #[test]
    fn rejected_chunks_give_up_after_three_attempts() {
        let mut emu = EmuMinisystem::new();
        emu.reject_loads = u32::MAX;
        let err = load_stage(&mut emu, 0x2000, &[0x22; 64], &CancelToken::default())
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::ChunkVerifyFailed { addr: 0x2000, attempts: 3 }
        ));
    }

    #[test]
    fn verify_substitutes_the_device_config_version() {
        let image = berlin_image(false);
        let props = DeviceProperties {
            product_id: "9966".into(),
            sensor_id: 0,
            version_major: 0,
            version_minor: 0x010407,
            config_id: None,
        };
        verify(&props, &image).unwrap();

        let image = berlin_image(true);
        // bundled config version 0x09, device still reports 0x07
        let err = verify(&props, &image).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::VerifyFailed { device: 0x010407, image: 0x010409 }
        ));
    }

    #[test]
    fn spe_frame_carries_length_and_checksum() {
        let mut emu = EmuMinisystem::new();
        spe_cmd(&mut emu, &[0x04]).unwrap();
        let frame = &emu.spe_frames[0];
        assert_eq!(frame, &vec![0x00, 0x00, 0x04, 0x04, 0x08, 0x00]);
    }

    #[test]
    fn config_download_applies_after_clean_readback() {
        let image = berlin_image(true);
        let mut emu = EmuMinisystem::new();
        send_config(&mut emu, &image).unwrap();
        let cmds: Vec<u8> = emu.spe_frames.iter().map(|f| f[3]).collect();
        assert_eq!(cmds, vec![SPE_CFG_PREPARE, SPE_CFG_APPLY, SPE_CFG_END]);
        // the builder seals the config version into payload byte 34
        let mut want = vec![0xCC; 300];
        want[34] = 0x09;
        assert_eq!(emu.regs.get(&CFG_BUFFER), Some(&want));
    }

    #[test]
    fn corrupt_readback_skips_apply_but_still_ends() {
        let image = berlin_image(true);
        let mut emu = EmuMinisystem::new();
        emu.corrupt_cfg_readback = true;
        let err = send_config(&mut emu, &image).unwrap_err();
        assert!(matches!(err, UpdateError::ConfigRejected { .. }));
        let cmds: Vec<u8> = emu.spe_frames.iter().map(|f| f[3]).collect();
        assert_eq!(cmds, vec![SPE_CFG_PREPARE, SPE_CFG_END]);
    }
}
