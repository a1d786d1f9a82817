//! ISP flash protocol for 16-bit-register families
//!
//! The controller is switched into its patch bootloader, each eligible
//! subsystem is staged through a RAM buffer at 0xC000 in 4 KiB chunks,
//! and the bootloader acks every chunk through a status register after
//! verifying the announced checksum. Config downloads go through the
//! family's interactive handshake against the command register.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::checksum::{sum8, sum16_be};
use crate::chip::{ChipVariant, ConfigHandshake};
use crate::error::{TransportError, UpdateError};
use crate::image::FirmwareImage;
use crate::packet::PacketLayout;
use crate::transport::{poll_reg, Transport};
use crate::update::{berlin, CancelToken};

const CMD_SWITCH_TO_PATCH: u8 = 0x10;
const CMD_START_UPDATE: u8 = 0x11;
const CMD_LOAD_FLASH: u8 = 0x12;
const CMD_RESTART: u8 = 0x13;

const BOOT_STATE_REG: u32 = 0x5095;
const LOAD_STATE_REG: u32 = 0x5096;
const STAGING_BUFFER: u32 = 0xC000;
const CHUNK_LEN: usize = 4096;

const BOOT_READY: u8 = 0xDD;
const LOAD_ACK: u8 = 0xAA;
const LOAD_RETRIES: u32 = 6;

const CFG_CMD_START: [u8; 3] = [0x80, 0x00, 0x80];
const CFG_CMD_SEND: u8 = 0x83;
const CFG_STATE_READY: u8 = 0x82;
const CFG_STATE_IDLE: u8 = 0xFF;
const CFG_DONE: u8 = 0x7F;
const CFG_END: u8 = 0x7D;

/// Flash every subsystem selected by `mask`, plus the config through the
/// ISP when `isp_cfg` carries its flash address and the sensor id.
pub(super) fn flash_firmware<T: Transport + ?Sized>(
    t: &mut T,
    variant: &ChipVariant,
    image: &FirmwareImage,
    mask: u32,
    isp_cfg: Option<(u32, u8)>,
    cancel: &CancelToken,
) -> Result<(), UpdateError> {
    if image.subsystems().is_empty() {
        return Err(UpdateError::NoFirmwareData);
    }
    let eligible: Vec<_> = image
        .subsystems()
        .iter()
        .filter(|s| s.kind < 32 && mask & (1u32 << s.kind) != 0)
        .collect();
    if eligible.is_empty() {
        return Err(UpdateError::NoEligibleSubsystem);
    }

    let result = (|| {
        enter_isp(t)?;
        for sub in eligible {
            info!(
                "flashing subsystem type {} at 0x{:06X} ({} bytes)",
                sub.kind,
                sub.flash_addr,
                sub.data.len()
            );
            load_subsystem(t, sub.flash_addr, image.subsystem_data(sub), cancel)?;
        }

        if let Some((addr, sensor_id)) = isp_cfg {
            // the flag asked for a config flash; not carrying one for
            // this sensor is fatal here, unlike the interactive path
            let cfg = image
                .sub_config_for(sensor_id)
                .ok_or(UpdateError::NoMatchingConfig { sensor_id })?;
            info!("flashing config for sensor {sensor_id} at 0x{addr:06X}");
            load_subsystem(t, addr, image.bytes(cfg.data.clone()), cancel)?;
        }
        Ok(())
    })();

    // the controller is restarted whether the flash stuck or not, so a
    // failed run never strands it in the bootloader
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

/// Switch into the patch bootloader and open the update session.
fn enter_isp<T: Transport + ?Sized>(t: &mut T) -> Result<(), UpdateError> {
    let report = PacketLayout::CLASSIC.encode_cmd_report(CMD_SWITCH_TO_PATCH, &[1])?;
    t.send_report(&report)?;
    thread::sleep(Duration::from_millis(250));
    poll_reg(t, BOOT_STATE_REG, BOOT_READY, 6, Duration::from_millis(30))
        .map_err(|_| UpdateError::BootloaderNotReady)?;

    let report = PacketLayout::CLASSIC.encode_cmd_report(CMD_START_UPDATE, &[1])?;
    t.send_report(&report)?;
    thread::sleep(Duration::from_millis(100));
    Ok(())
}

/// Stage one subsystem chunk by chunk; every chunk is re-sent until the
/// bootloader acks its checksum or the retry budget runs out.
fn load_subsystem<T: Transport + ?Sized>(
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

            let cks = sum16_be(chunk);
            let mut payload = [0u8; 6];
            payload[0..2].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            payload[2] = (addr >> 16) as u8;
            payload[3] = (addr >> 8) as u8;
            payload[4..6].copy_from_slice(&cks.to_be_bytes());
            let report = PacketLayout::CLASSIC.encode_cmd_report(CMD_LOAD_FLASH, &payload)?;
            t.send_report(&report)?;
            thread::sleep(Duration::from_millis(80));

            match poll_reg(t, LOAD_STATE_REG, LOAD_ACK, 100, Duration::from_millis(2)) {
                Ok(()) => {
                    // clear the ack before the next chunk
                    t.write_regs(LOAD_STATE_REG, &[0])
                        .map_err(UpdateError::WriteFailed)?;
                    break;
                }
                Err(e) => {
                    attempts += 1;
                    warn!("chunk at 0x{addr:06X} not acked (attempt {attempts}): {e}");
                    if attempts >= LOAD_RETRIES {
                        return Err(UpdateError::ChunkVerifyFailed { addr, attempts });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Leave the bootloader; the reset report is fire-and-forget and sent a
/// few times since the controller may drop it mid-reset.
fn restart<T: Transport + ?Sized>(t: &mut T) -> Result<(), UpdateError> {
    let report = PacketLayout::CLASSIC.encode_cmd_report(CMD_RESTART, &[1])?;
    for _ in 0..3 {
        if let Err(e) = t.send_report(&report) {
            debug!("restart report dropped: {e}");
        }
        thread::sleep(Duration::from_millis(20));
    }
    thread::sleep(Duration::from_millis(300));
    Ok(())
}

/// Download the config matching `sensor_id` through the family's
/// interactive handshake.
pub(super) fn download_config<T: Transport + ?Sized>(
    t: &mut T,
    variant: &ChipVariant,
    image: &FirmwareImage,
    sensor_id: u8,
) -> Result<(), UpdateError> {
    match variant.handshake {
        ConfigHandshake::Unsupported => {
            warn!("{} has no interactive config path, skipping", variant.name);
            Ok(())
        }
        ConfigHandshake::Plain { wait_idle } => {
            let Some(cfg) = image.sub_config_for(sensor_id) else {
                warn!("no bundled config for sensor {sensor_id}, skipping the download");
                return Ok(());
            };
            download_plain(t, variant, image.bytes(cfg.data.clone()), wait_idle)
        }
        ConfigHandshake::Checksummed => {
            let Some(cfg) = image.sub_config_for(sensor_id) else {
                warn!("no bundled config for sensor {sensor_id}, skipping the download");
                return Ok(());
            };
            download_checksummed(t, variant, image.bytes(cfg.data.clone()))
        }
        ConfigHandshake::Berlin => berlin::send_config(t, image),
    }
}

fn cfg_regs(variant: &ChipVariant) -> Result<(u32, u32), UpdateError> {
    match (variant.cmd_reg, variant.cfg_reg) {
        (Some(cmd), Some(cfg)) => Ok((cmd, cfg)),
        _ => Err(UpdateError::NotReady),
    }
}

fn download_plain<T: Transport + ?Sized>(
    t: &mut T,
    variant: &ChipVariant,
    payload: &[u8],
    wait_idle: bool,
) -> Result<(), UpdateError> {
    let (cmd_reg, cfg_reg) = cfg_regs(variant)?;

    if variant.strict_cfg_check {
        if let Some(residue) = cfg_version_residue(t, cfg_reg)? {
            warn!("config version block checksum residue 0x{residue:02X} before download");
        }
    }
    if wait_idle {
        poll_reg(t, cmd_reg, CFG_STATE_IDLE, 10, Duration::from_millis(10))
            .map_err(rejected)?;
    }

    t.write_regs(cmd_reg, &CFG_CMD_START)
        .map_err(UpdateError::WriteFailed)?;
    thread::sleep(Duration::from_millis(250));
    poll_reg(t, cmd_reg, CFG_STATE_READY, 6, Duration::from_millis(30)).map_err(rejected)?;

    t.write_regs(cfg_reg, payload)
        .map_err(UpdateError::WriteFailed)?;
    thread::sleep(Duration::from_millis(100));
    t.write_regs(cmd_reg, &[CFG_CMD_SEND])
        .map_err(UpdateError::WriteFailed)?;
    thread::sleep(Duration::from_millis(80));
    poll_reg(t, cmd_reg, CFG_STATE_IDLE, 6, Duration::from_millis(30)).map_err(rejected)?;

    if variant.strict_cfg_check {
        if let Some(residue) = cfg_version_residue(t, cfg_reg)? {
            return Err(UpdateError::ConfigRejected { status: residue });
        }
    }
    Ok(())
}

/// Nonzero sum over the 3-byte config version block, `None` when clean.
fn cfg_version_residue<T: Transport + ?Sized>(
    t: &mut T,
    cfg_reg: u32,
) -> Result<Option<u8>, UpdateError> {
    let mut ver = [0u8; 3];
    t.read_regs(cfg_reg, &mut ver)?;
    let residue = (sum8(&ver) & 0xFF) as u8;
    Ok((residue != 0).then_some(residue))
}

/// GT7868Q handshake: every command is a 5-byte frame carrying its own
/// 16-bit checksum, and completion is a 5-byte status readback.
fn download_checksummed<T: Transport + ?Sized>(
    t: &mut T,
    variant: &ChipVariant,
    payload: &[u8],
) -> Result<(), UpdateError> {
    let (cmd_reg, cfg_reg) = cfg_regs(variant)?;

    poll_reg(t, cmd_reg, CFG_STATE_IDLE, 10, Duration::from_millis(10)).map_err(rejected)?;
    t.write_regs(cmd_reg, &cmd_frame(0x80))
        .map_err(UpdateError::WriteFailed)?;
    poll_reg(t, cmd_reg, CFG_STATE_READY, 6, Duration::from_millis(30)).map_err(rejected)?;

    t.write_regs(cfg_reg, payload)
        .map_err(UpdateError::WriteFailed)?;
    thread::sleep(Duration::from_millis(100));
    t.write_regs(cmd_reg, &cmd_frame(CFG_CMD_SEND))
        .map_err(UpdateError::WriteFailed)?;

    let mut status = 0u8;
    let mut done = false;
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(30));
        let mut buf = [0u8; 5];
        if let Err(e) = t.read_regs(cmd_reg, &mut buf) {
            debug!("config status read failed: {e}");
            continue;
        }
        status = buf[0];
        if buf[0] == CFG_DONE {
            done = true;
            break;
        }
        if buf[0] == 0x7E && buf[1] == 0x00 && buf[2] == 0x07 {
            info!("device reports the config is already identical");
            done = true;
            break;
        }
    }
    // the end frame is owed to the device whether the download stuck or
    // not
    if let Err(e) = t.write_regs(cmd_reg, &cmd_frame(CFG_END)) {
        debug!("config end frame dropped: {e}");
    }
    if done {
        Ok(())
    } else {
        Err(UpdateError::ConfigRejected { status })
    }
}

/// `{cmd, 0, 0, cks_hi, cks_lo}` with the sum of the first three bytes.
fn cmd_frame(cmd: u8) -> [u8; 5] {
    let cks = cmd as u16;
    [cmd, 0, 0, (cks >> 8) as u8, cks as u8]
}

fn rejected(e: TransportError) -> UpdateError {
    match e {
        TransportError::SentinelTimeout { last, .. } => {
            UpdateError::ConfigRejected { status: last }
        }
        other => UpdateError::Transport(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipFamily;
    use crate::image::testutil::LegacyImageBuilder;
    use std::collections::HashMap;

    /// Register-level emulation of a classic-protocol bootloader: acks
    /// staged chunks whose announced checksum matches, tracks flashed
    /// data per flash address.
    struct EmuBootloader {
        regs: HashMap<u32, Vec<u8>>,
        staging: Vec<u8>,
        flashed: HashMap<u32, Vec<u8>>,
        resets: u32,
        reject_loads: u32,
        cfg_payload: Option<Vec<u8>>,
        cmd_log: Vec<Vec<u8>>,
    }

    impl EmuBootloader {
        fn new() -> Self {
            EmuBootloader {
                regs: HashMap::new(),
                staging: Vec::new(),
                flashed: HashMap::new(),
                resets: 0,
                reject_loads: 0,
                cfg_payload: None,
                cmd_log: Vec::new(),
            }
        }

        fn set_reg(&mut self, addr: u32, val: u8) {
            self.regs.insert(addr, vec![val]);
        }
    }

    impl Transport for EmuBootloader {
        fn read_regs(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TransportError> {
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
            if addr == 0x8040 {
                self.cmd_log.push(data.to_vec());
                if data == CFG_CMD_START {
                    self.set_reg(0x8040, CFG_STATE_READY);
                } else if data == [CFG_CMD_SEND] {
                    self.set_reg(0x8040, CFG_STATE_IDLE);
                }
                return Ok(());
            }
            if addr == 0x8050 {
                self.cfg_payload = Some(data.to_vec());
            }
            self.regs.insert(addr, data.to_vec());
            Ok(())
        }

        fn send_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
            match report[1] {
                CMD_SWITCH_TO_PATCH => self.set_reg(BOOT_STATE_REG, BOOT_READY),
                CMD_START_UPDATE => {}
                CMD_LOAD_FLASH => {
                    if self.reject_loads > 0 {
                        self.reject_loads -= 1;
                        self.set_reg(LOAD_STATE_REG, 0x33);
                        return Ok(());
                    }
                    let len = u16::from_be_bytes([report[5], report[6]]) as usize;
                    let addr =
                        ((report[7] as u32) << 16) | ((report[8] as u32) << 8);
                    let cks = u16::from_be_bytes([report[9], report[10]]);
                    if len == self.staging.len() && cks == sum16_be(&self.staging) {
                        self.flashed
                            .entry(addr)
                            .or_default()
                            .extend_from_slice(&self.staging);
                        self.set_reg(LOAD_STATE_REG, LOAD_ACK);
                    } else {
                        self.set_reg(LOAD_STATE_REG, 0x33);
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

    fn phoenix_image() -> FirmwareImage {
        let variant = ChipFamily::Phoenix.variant();
        let blob = LegacyImageBuilder::new(variant)
            .pid("7388")
            .cid(1)
            .vid([0, 1, 2])
            .subsystem(2, 0x2000, &[0x5A; 5000])
            .subsystem(9, 0x9000, &[0x66; 100])
            .config(0b0011, &[(1, &[0xC1; 64])])
            .build();
        FirmwareImage::parse(blob, variant).unwrap()
    }

    #[test]
    fn firmware_flash_stages_masked_subsystems() {
        let variant = ChipFamily::Phoenix.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        // mask selects only type 2; type 9 must be skipped
        flash_firmware(&mut emu, variant, &image, 1 << 2, None, &CancelToken::default())
            .unwrap();
        assert_eq!(emu.flashed.get(&0x2000).map(Vec::len), Some(5000));
        assert!(!emu.flashed.contains_key(&0x9000));
        assert_eq!(emu.resets, 3);
    }

    #[test]
    fn isp_config_lands_at_the_config_flash_address() {
        let variant = ChipFamily::Phoenix.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        flash_firmware(
            &mut emu,
            variant,
            &image,
            1 << 2,
            Some((0x3E000, 1)),
            &CancelToken::default(),
        )
        .unwrap();
        assert_eq!(emu.flashed.get(&0x3E000), Some(&vec![0xC1; 64]));
    }

    #[test]
    fn unknown_sensor_id_fails_the_isp_config_but_restarts() {
        let variant = ChipFamily::Phoenix.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        let err = flash_firmware(
            &mut emu,
            variant,
            &image,
            1 << 2,
            Some((0x3E000, 9)),
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::NoMatchingConfig { sensor_id: 9 }
        ));
        assert!(!emu.flashed.contains_key(&0x3E000));
        assert_eq!(emu.resets, 3);
    }

    #[test]
    fn out_of_range_subsystem_type_is_skipped() {
        let variant = ChipFamily::Phoenix.variant();
        let blob = LegacyImageBuilder::new(variant)
            .pid("7388")
            .cid(1)
            .vid([0, 1, 0])
            .subsystem(2, 0x2000, &[0x5A; 100])
            .subsystem(40, 0x9000, &[0x66; 100])
            .build();
        let image = FirmwareImage::parse(blob, variant).unwrap();
        let mut emu = EmuBootloader::new();
        // type 40 has no mask bit; it must be ignored, not shift-overflow
        flash_firmware(&mut emu, variant, &image, u32::MAX, None, &CancelToken::default())
            .unwrap();
        assert_eq!(emu.flashed.get(&0x2000).map(Vec::len), Some(100));
        assert!(!emu.flashed.contains_key(&0x9000));
    }

    #[test]
    fn failed_flash_still_restarts_the_controller() {
        let variant = ChipFamily::Phoenix.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        emu.reject_loads = u32::MAX;
        let err = flash_firmware(
            &mut emu,
            variant,
            &image,
            1 << 2,
            None,
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(err, UpdateError::ChunkVerifyFailed { .. }));
        assert_eq!(emu.resets, 3);
    }

    #[test]
    fn empty_mask_is_rejected_before_touching_the_device() {
        let variant = ChipFamily::Phoenix.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        let err = flash_firmware(&mut emu, variant, &image, 0, None, &CancelToken::default())
            .unwrap_err();
        assert!(matches!(err, UpdateError::NoEligibleSubsystem));
        assert_eq!(emu.resets, 0);
        assert!(emu.flashed.is_empty());
    }

    #[test]
    fn rejected_chunks_are_resent() {
        let mut emu = EmuBootloader::new();
        emu.reject_loads = 2;
        load_subsystem(&mut emu, 0x2000, &[0x77; 100], &CancelToken::default()).unwrap();
        assert_eq!(emu.flashed.get(&0x2000), Some(&vec![0x77; 100]));
    }

    #[test]
    fn chunk_rejection_gives_up_after_six_attempts() {
        let mut emu = EmuBootloader::new();
        emu.reject_loads = u32::MAX;
        let err =
            load_subsystem(&mut emu, 0x2000, &[0x77; 100], &CancelToken::default()).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::ChunkVerifyFailed { addr: 0x2000, attempts: 6 }
        ));
    }

    #[test]
    fn cancelled_token_stops_before_the_first_chunk() {
        let mut emu = EmuBootloader::new();
        let cancel = CancelToken::default();
        cancel.cancel();
        let err = load_subsystem(&mut emu, 0x2000, &[0x77; 100], &cancel).unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
        assert!(emu.flashed.is_empty());
    }

    #[test]
    fn unknown_sensor_id_skips_the_interactive_download() {
        let variant = ChipFamily::Nanjing.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        download_config(&mut emu, variant, &image, 9).unwrap();
        assert!(emu.cfg_payload.is_none());
        assert!(emu.cmd_log.is_empty());
    }

    #[test]
    fn plain_config_handshake_delivers_the_payload() {
        let variant = ChipFamily::Nanjing.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        download_config(&mut emu, variant, &image, 1).unwrap();
        assert_eq!(emu.cfg_payload, Some(vec![0xC1; 64]));
        assert_eq!(emu.cmd_log.first(), Some(&CFG_CMD_START.to_vec()));
        assert_eq!(emu.cmd_log.last(), Some(&vec![CFG_CMD_SEND]));
    }

    #[test]
    fn unresponsive_device_rejects_the_config() {
        let variant = ChipFamily::NormandyL.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        // 0x60CC never leaves 0, so the idle wait times out
        let err = download_config(&mut emu, variant, &image, 1).unwrap_err();
        assert!(matches!(err, UpdateError::ConfigRejected { status: 0 }));
    }

    #[test]
    fn mousepad_config_download_is_a_noop() {
        let variant = ChipFamily::Mousepad.variant();
        let image = phoenix_image();
        let mut emu = EmuBootloader::new();
        download_config(&mut emu, variant, &image, 1).unwrap();
        assert!(emu.cfg_payload.is_none());
    }

    #[test]
    fn checksummed_command_frame_bytes() {
        assert_eq!(cmd_frame(0x83), [0x83, 0x00, 0x00, 0x00, 0x83]);
        assert_eq!(cmd_frame(0x7D), [0x7D, 0x00, 0x00, 0x00, 0x7D]);
    }
}
