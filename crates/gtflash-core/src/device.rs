//! Live device identity
//!
//! Reads the controller's version registers and decodes them into
//! [`DeviceProperties`]. The decode differs per family: most parts keep a
//! firmware info block plus a separate config version byte, GTx3/GTx5
//! report BCD-coded versions, Berlin parts answer with an identity block
//! and a config id register.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::checksum::sum8;
use crate::chip::{ChipVariant, InfoCheck, InfoDecode};
use crate::error::{DeviceError, TransportError};
use crate::transport::Transport;

const REFRESH_ATTEMPTS: u32 = 10;
const REFRESH_INTERVAL: Duration = Duration::from_millis(30);

const COORD_DISABLE: [u8; 5] = [0x33, 0x00, 0x00, 0x00, 0x33];
const COORD_ENABLE: [u8; 5] = [0x34, 0x00, 0x00, 0x00, 0x34];
const COORD_DISABLE_RETRIES: u32 = 3;

/// Identity and version state read from a live controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Product id string
    pub product_id: String,
    /// Sensor id, selects the matching sub-config
    pub sensor_id: u8,
    /// Major firmware version
    pub version_major: u32,
    /// Minor version composite; low byte is the config version where the
    /// family tracks one
    pub version_minor: u32,
    /// Config id register value (Berlin only)
    pub config_id: Option<u32>,
}

impl DeviceProperties {
    /// Read the device identity, retrying while the controller settles.
    ///
    /// A freshly reset controller can answer reads with garbage or not at
    /// all, so transport and checksum failures are retried a few times
    /// before the last error is reported.
    pub fn refresh<T: Transport + ?Sized>(
        t: &mut T,
        variant: &ChipVariant,
    ) -> Result<DeviceProperties, DeviceError> {
        let mut last_err = DeviceError::NotReady {
            attempts: REFRESH_ATTEMPTS,
        };
        for attempt in 0..REFRESH_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(REFRESH_INTERVAL);
            }
            match read_once(t, variant) {
                Ok(props) => {
                    info!(
                        "device: pid {:?}, sensor {}, version {:#x}.{:#06x}",
                        props.product_id,
                        props.sensor_id,
                        props.version_major,
                        props.version_minor
                    );
                    return Ok(props);
                }
                Err(e) => {
                    debug!("identity read attempt {} failed: {e}", attempt + 1);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

fn read_once<T: Transport + ?Sized>(
    t: &mut T,
    variant: &ChipVariant,
) -> Result<DeviceProperties, DeviceError> {
    if variant.coord_report_guard {
        let r = with_coord_reports_off(t, variant, |t| decode(t, variant));
        return r;
    }
    decode(t, variant)
}

/// Pause coordinate reporting around the register reads so the touch
/// data stream cannot clobber them, and always turn it back on.
fn with_coord_reports_off<T, F, R>(
    t: &mut T,
    variant: &ChipVariant,
    f: F,
) -> Result<R, DeviceError>
where
    T: Transport + ?Sized,
    F: FnOnce(&mut T) -> Result<R, DeviceError>,
{
    let cmd_reg = variant.cmd_reg.unwrap_or_default();
    let mut disabled = false;
    for _ in 0..COORD_DISABLE_RETRIES {
        match t.write_regs(cmd_reg, &COORD_DISABLE) {
            Ok(()) => {
                disabled = true;
                break;
            }
            Err(e) => debug!("coordinate disable failed: {e}"),
        }
        thread::sleep(Duration::from_millis(10));
    }
    let result = f(t);
    if disabled {
        if let Err(e) = t.write_regs(cmd_reg, &COORD_ENABLE) {
            warn!("failed to re-enable coordinate reporting: {e}");
        }
    }
    result
}

fn decode<T: Transport + ?Sized>(
    t: &mut T,
    variant: &ChipVariant,
) -> Result<DeviceProperties, DeviceError> {
    match variant.decode {
        InfoDecode::Block {
            pid_at,
            sensor_at,
            sensor_mask,
            major_at,
            vid_at,
            check,
        } => {
            let cfg_version = read_cfg_version(t, variant)?;
            let mut info = vec![0u8; variant.info_len];
            t.read_regs(variant.version_addr, &mut info)?;
            verify_info(&info, check)?;

            let product_id = crate::image::trim_pid(&info[pid_at..pid_at + 4]);
            let sensor_id = info[sensor_at] & sensor_mask;
            // GT7288 reports its version fields shifted up one byte and
            // leaves the middle minor byte unused.
            let (version_major, version_minor) =
                if variant.pid7288_quirk && product_id == "7288" {
                    (
                        info[vid_at] as u32,
                        ((info[vid_at + 1] as u32) << 16) | cfg_version as u32,
                    )
                } else {
                    (
                        info[major_at] as u32,
                        ((info[vid_at] as u32) << 16)
                            | ((info[vid_at + 1] as u32) << 8)
                            | cfg_version as u32,
                    )
                };
            Ok(DeviceProperties {
                product_id,
                sensor_id,
                version_major,
                version_minor,
                config_id: None,
            })
        }
        InfoDecode::Bcd => {
            let mut info = vec![0u8; variant.info_len];
            t.read_regs(variant.version_addr, &mut info)?;
            Ok(DeviceProperties {
                product_id: crate::image::trim_pid(&info[0..4]),
                sensor_id: info[10] & 0x0F,
                version_major: bcd(info[5]),
                version_minor: bcd(info[6]),
                config_id: None,
            })
        }
        InfoDecode::Berlin => {
            let mut ident = vec![0u8; variant.info_len];
            t.read_regs(variant.version_addr, &mut ident)?;
            let product_id = crate::image::trim_pid(&ident[0..8]);
            let sensor_id = ident[13];
            let vice = ident[10] as u32;
            let inter = ident[11] as u32;

            let (config_id, cfg_version) = match variant.config_id_addr {
                Some(addr) => {
                    let mut cfg = [0u8; 5];
                    t.read_regs(addr, &mut cfg)?;
                    let id = u32::from_le_bytes([cfg[0], cfg[1], cfg[2], cfg[3]]);
                    (Some(id), cfg[4] as u32)
                }
                None => (None, 0),
            };

            Ok(DeviceProperties {
                product_id,
                sensor_id,
                version_major: 0,
                version_minor: (vice << 16) | (inter << 8) | cfg_version,
                config_id,
            })
        }
    }
}

fn read_cfg_version<T: Transport + ?Sized>(
    t: &mut T,
    variant: &ChipVariant,
) -> Result<u8, TransportError> {
    match variant.cfg_reg {
        Some(addr) => {
            let mut b = [0u8];
            t.read_regs(addr, &mut b)?;
            Ok(b[0])
        }
        None => Ok(0),
    }
}

fn verify_info(info: &[u8], check: InfoCheck) -> Result<(), DeviceError> {
    match check {
        InfoCheck::None => Ok(()),
        InfoCheck::Sum8Zero => {
            let residue = sum8(info) & 0xFF;
            if residue != 0 {
                return Err(DeviceError::InfoChecksum { residue });
            }
            Ok(())
        }
        InfoCheck::TailSum => {
            let n = info.len();
            let computed = sum8(&info[..n - 2]);
            let expected = u16::from_be_bytes([info[n - 2], info[n - 1]]);
            if computed != expected {
                return Err(DeviceError::InfoChecksum {
                    residue: computed ^ expected,
                });
            }
            Ok(())
        }
    }
}

fn bcd(b: u8) -> u32 {
    ((b >> 4) as u32) * 10 + (b & 0x0F) as u32
}
