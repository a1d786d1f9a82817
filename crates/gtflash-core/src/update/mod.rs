//! Firmware update engine
//!
//! Drives a full update run against a [`Transport`]: read the device
//! identity, check eligibility, flash firmware subsystems, download the
//! config, and verify. The register-level work differs by protocol
//! generation and lives in the `classic` and `berlin` submodules.

mod berlin;
mod classic;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::chip::{ChipVariant, ImageFormat, Protocol};
use crate::device::DeviceProperties;
use crate::error::UpdateError;
use crate::image::{FirmwareImage, UpdateFlag};
use crate::transport::Transport;

/// Flash attempts per phase (one initial try plus three reloads).
const PHASE_ATTEMPTS: u32 = 4;
const PHASE_FAIL_COOLDOWN: Duration = Duration::from_millis(200);
const PHASE_DONE_COOLDOWN: Duration = Duration::from_millis(300);

/// HID subsystem type id, force-included on old GTx3/GTx5 firmware.
const HID_SUBSYS_TYPE: u8 = 5;

/// Knobs for one update run.
#[derive(Debug, Clone, Default)]
pub struct UpdateParams {
    /// Skip the PID and version eligibility checks
    pub force: bool,
    /// Override the variant's default subsystem type mask
    pub subsystem_mask: Option<u32>,
}

/// Cooperative cancellation flag, checked between flash chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Request cancellation; the run stops at the next chunk boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }
}

/// One update run over a transport.
pub struct UpdateEngine<T> {
    transport: T,
    variant: &'static ChipVariant,
    cancel: CancelToken,
}

impl<T: Transport> UpdateEngine<T> {
    /// Build an engine for a detected chip variant.
    pub fn new(transport: T, variant: &'static ChipVariant) -> UpdateEngine<T> {
        UpdateEngine {
            transport,
            variant,
            cancel: CancelToken::default(),
        }
    }

    /// Token that cancels this engine's run from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Consume the engine and hand the transport back.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Read the device identity without updating anything.
    pub fn properties(&mut self) -> Result<DeviceProperties, UpdateError> {
        if !self.transport.is_open() {
            return Err(UpdateError::NotReady);
        }
        Ok(DeviceProperties::refresh(&mut self.transport, self.variant)?)
    }

    /// Run a full firmware update. Returns the device properties read
    /// after the final restart.
    pub fn run(
        &mut self,
        image: &FirmwareImage,
        params: &UpdateParams,
    ) -> Result<DeviceProperties, UpdateError> {
        let props = self.properties()?;
        if params.force {
            warn!("forced update, skipping eligibility checks");
        } else {
            check_eligibility(&props, image, self.variant)?;
        }
        let flag = image.update_flag();
        info!("update flag: {flag:?}");

        match self.variant.protocol {
            Protocol::Classic => self.run_classic(image, params, props, flag),
            Protocol::Berlin => self.run_berlin(image),
        }
    }

    /// Download only the bundled config through the interactive path,
    /// leaving the firmware untouched.
    pub fn update_config(&mut self, image: &FirmwareImage) -> Result<(), UpdateError> {
        let props = self.properties()?;
        match self.variant.protocol {
            Protocol::Classic => classic::download_config(
                &mut self.transport,
                self.variant,
                image,
                props.sensor_id,
            ),
            Protocol::Berlin => berlin::send_config(&mut self.transport, image),
        }
    }

    fn run_classic(
        &mut self,
        image: &FirmwareImage,
        params: &UpdateParams,
        props: DeviceProperties,
        flag: UpdateFlag,
    ) -> Result<DeviceProperties, UpdateError> {
        let base = params.subsystem_mask.unwrap_or(self.variant.default_mask);
        let mask = decide_mask(base, self.variant, &props, image, flag);
        let hid_forced = mask != base;

        // Config goes through the ISP alongside the firmware when the
        // image asks for it, or when the HID subsystem reflash would
        // wipe the stored config anyway.
        let cfg_via_isp = image.has_config()
            && flag.contains(UpdateFlag::CONFIG)
            && (flag.contains(UpdateFlag::CONFIG_VIA_ISP) || hid_forced)
            && self.variant.cfg_flash_addr.is_some();
        let isp_cfg = if cfg_via_isp {
            self.variant
                .cfg_flash_addr
                .map(|addr| (addr, props.sensor_id))
        } else {
            None
        };

        let mut props = props;
        if flag.contains(UpdateFlag::FIRMWARE) {
            let transport = &mut self.transport;
            let variant = self.variant;
            let cancel = &self.cancel;
            with_retries("firmware", || {
                classic::flash_firmware(transport, variant, image, mask, isp_cfg, cancel)
            })?;
            props = DeviceProperties::refresh(&mut self.transport, self.variant)?;
        }

        if flag.contains(UpdateFlag::CONFIG) && image.has_config() && !cfg_via_isp {
            let transport = &mut self.transport;
            let variant = self.variant;
            let sensor_id = props.sensor_id;
            with_retries("config", || {
                classic::download_config(transport, variant, image, sensor_id)
            })?;
        }

        Ok(props)
    }

    fn run_berlin(&mut self, image: &FirmwareImage) -> Result<DeviceProperties, UpdateError> {
        {
            let transport = &mut self.transport;
            let cancel = &self.cancel;
            with_retries("firmware", || {
                berlin::flash_session(transport, image, cancel)
            })?;
        }
        let props = DeviceProperties::refresh(&mut self.transport, self.variant)?;
        berlin::verify(&props, image)?;
        Ok(props)
    }
}

/// PID and version gate in front of an unforced update.
fn check_eligibility(
    props: &DeviceProperties,
    image: &FirmwareImage,
    variant: &ChipVariant,
) -> Result<(), UpdateError> {
    let n = variant.pid_compare_len;
    if props
        .product_id
        .chars()
        .take(n)
        .ne(image.product_id().chars().take(n))
    {
        return Err(UpdateError::ProductMismatch {
            device: props.product_id.clone(),
            image: image.product_id().to_string(),
        });
    }

    let image_minor = comparable_image_minor(image, props, variant);
    if props.version_major == image.version_major() && props.version_minor == image_minor {
        return Err(UpdateError::AlreadyUpToDate);
    }
    info!(
        "device {:#x}.{:#06x} -> image {:#x}.{:#06x}",
        props.version_major,
        props.version_minor,
        image.version_major(),
        image_minor
    );
    Ok(())
}

/// Image minor adjusted for comparison against the device: structured
/// images without a bundled config keep the device's config version in
/// the low byte.
fn comparable_image_minor(
    image: &FirmwareImage,
    props: &DeviceProperties,
    variant: &ChipVariant,
) -> u32 {
    let minor = image.version_minor();
    if variant.format == ImageFormat::Structured && !image.has_config() {
        (minor & 0xFFFF_FF00) | (props.version_minor & 0xFF)
    } else {
        minor
    }
}

/// Compute the effective subsystem mask, forcing the HID subsystem in
/// when the image requests it or either side runs firmware older than
/// the variant's boundary.
fn decide_mask(
    base: u32,
    variant: &ChipVariant,
    props: &DeviceProperties,
    image: &FirmwareImage,
    flag: UpdateFlag,
) -> u32 {
    let Some(boundary) = variant.hid_boundary else {
        return base;
    };
    let device = composite(props.version_major, props.version_minor);
    let bundled = composite(image.version_major(), image.version_minor());
    if flag.contains(UpdateFlag::HID_SUBSYSTEM) || device < boundary || bundled < boundary {
        info!("forcing HID subsystem into the update");
        base | (1 << HID_SUBSYS_TYPE)
    } else {
        base
    }
}

fn composite(major: u32, minor: u32) -> u32 {
    (major << 16) | ((minor >> 8) & 0xFFFF)
}

fn with_retries<F>(what: &str, mut f: F) -> Result<(), UpdateError>
where
    F: FnMut() -> Result<(), UpdateError>,
{
    let mut last = UpdateError::NotReady;
    for attempt in 1..=PHASE_ATTEMPTS {
        match f() {
            Ok(()) => {
                info!("{what} update done");
                thread::sleep(PHASE_DONE_COOLDOWN);
                return Ok(());
            }
            Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
            Err(e) => {
                warn!("{what} update attempt {attempt}/{PHASE_ATTEMPTS} failed: {e}");
                last = e;
                thread::sleep(PHASE_FAIL_COOLDOWN);
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipFamily;
    use crate::image::testutil::LegacyImageBuilder;

    fn props(pid: &str, major: u32, minor: u32) -> DeviceProperties {
        DeviceProperties {
            product_id: pid.to_string(),
            sensor_id: 1,
            version_major: major,
            version_minor: minor,
            config_id: None,
        }
    }

    fn phoenix_image(cid: u8, vid: [u8; 3]) -> FirmwareImage {
        let variant = ChipFamily::Phoenix.variant();
        let blob = LegacyImageBuilder::new(variant)
            .pid("7388")
            .cid(cid)
            .vid(vid)
            .subsystem(2, 0x2000, &[0u8; 32])
            .build();
        FirmwareImage::parse(blob, variant).unwrap()
    }

    #[test]
    fn mismatched_pid_is_rejected() {
        let variant = ChipFamily::Phoenix.variant();
        let img = phoenix_image(1, [0, 1, 2]);
        let err = check_eligibility(&props("7288", 0, 0), &img, variant).unwrap_err();
        assert!(matches!(err, UpdateError::ProductMismatch { .. }));
    }

    #[test]
    fn equal_versions_skip_the_update() {
        let variant = ChipFamily::Phoenix.variant();
        // byte 26 doubles as the subsystem count in this layout, so the
        // one-subsystem image minor ends in 0x01
        let img = phoenix_image(1, [0x00, 0x01, 0x00]);
        assert_eq!(img.version_minor(), 0x0101);
        let err = check_eligibility(&props("7388", 1, 0x0101), &img, variant).unwrap_err();
        assert!(matches!(err, UpdateError::AlreadyUpToDate));
        check_eligibility(&props("7388", 1, 0x0102), &img, variant).unwrap();
    }

    #[test]
    fn structured_minor_comparison_ignores_missing_config_byte() {
        let variant = ChipFamily::BerlinB.variant();
        let blob = crate::image::structured_testutil::StructuredImageBuilder::new()
            .pid("9966")
            .vid([0, 0, 0x01, 0x04])
            .subsystem(1, 0, &[0xB0; 64])
            .subsystem(2, 0x2000, &[0x11; 64])
            .build();
        let img = FirmwareImage::parse(blob, variant).unwrap();
        // device config version 0x09 must not make 01.04 look different
        let err = check_eligibility(&props("9966", 0, 0x010409), &img, variant).unwrap_err();
        assert!(matches!(err, UpdateError::AlreadyUpToDate));
    }

    #[test]
    fn old_firmware_forces_the_hid_subsystem() {
        let variant = ChipFamily::Phoenix.variant();
        let img = phoenix_image(1, [0x00, 0x20, 0x00]);
        // device 1.0x0116 is below the 0x0117 boundary
        let m = decide_mask(
            variant.default_mask,
            variant,
            &props("7388", 0, 0x011600),
            &img,
            UpdateFlag::FIRMWARE,
        );
        assert_eq!(m, variant.default_mask | (1 << HID_SUBSYS_TYPE));
        // both sides new enough: mask untouched
        let m = decide_mask(
            variant.default_mask,
            variant,
            &props("7388", 1, 0x020000),
            &img,
            UpdateFlag::FIRMWARE,
        );
        assert_eq!(m, variant.default_mask);
        // the image flag alone forces it
        let m = decide_mask(
            variant.default_mask,
            variant,
            &props("7388", 1, 0x020000),
            &img,
            UpdateFlag::FIRMWARE | UpdateFlag::HID_SUBSYSTEM,
        );
        assert_eq!(m, variant.default_mask | (1 << HID_SUBSYS_TYPE));
    }

    #[test]
    fn retries_stop_after_four_attempts() {
        let mut calls = 0;
        let err = with_retries("test", || {
            calls += 1;
            Err(UpdateError::BootloaderNotReady)
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, UpdateError::BootloaderNotReady));
    }

    #[test]
    fn cancellation_short_circuits_the_retry_loop() {
        let mut calls = 0;
        let err = with_retries("test", || {
            calls += 1;
            Err(UpdateError::Cancelled)
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, UpdateError::Cancelled));
    }
}
