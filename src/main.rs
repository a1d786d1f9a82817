//! gtflash - Firmware update tool for Goodix touch controllers
//!
//! Wires a transport (hidraw, raw I2C, or the in-memory emulator), a
//! firmware image, and the core update engine together. The chip family
//! is taken from `--type`/`--series` or detected from the hidraw
//! product code.

mod cli;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use cli::Cli;
use gtflash_core::chip::{ChipFamily, ChipVariant, Protocol};
use gtflash_core::error::UpdateError;
use gtflash_core::image::{ConfigBlock, FirmwareImage};
use gtflash_core::packet::PacketLayout;
use gtflash_core::transport::Transport;
use gtflash_core::update::{UpdateEngine, UpdateParams};
use gtflash_dummy::{EmulatedIc, Identity};
use gtflash_hidraw::HidrawDevice;
use gtflash_i2c::I2cDevice;

const EXIT_USAGE: u8 = 1;
const EXIT_OPEN: u8 = 2;
const EXIT_PARSE: u8 = 3;
const EXIT_ELIGIBILITY: u8 = 4;
const EXIT_FLASH: u8 = 5;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn run(cli: &Cli) -> Result<(), u8> {
    if cli.fw_props {
        let variant = family_from_flags(cli)?
            .ok_or_else(|| usage("--fw-props needs --type or --series"))?
            .variant();
        let image = load_image(cli, variant)?;
        println!(
            "{}:{:06X} {:X}.{:06X}",
            image.product_id(),
            image.version_minor(),
            image.version_major(),
            image.version_minor()
        );
        return Ok(());
    }

    if cli.dry_run {
        let family = family_from_flags(cli)?
            .ok_or_else(|| usage("--dry-run needs --type or --series"))?;
        let variant = family.variant();
        let image = load_image(cli, variant)?;
        let ic = emulated_target(family, &image);
        log::info!("dry run against an emulated {}", variant.name);
        return drive(UpdateEngine::new(ic, variant), cli, variant);
    }

    let device = cli
        .device
        .as_ref()
        .ok_or_else(|| usage("--device is required"))?;
    let device_str = device.to_string_lossy();

    if is_i2c_node(device) {
        let family = family_from_flags(cli)?.unwrap_or(ChipFamily::BerlinB);
        let variant = family.variant();
        if variant.protocol != Protocol::Berlin {
            return Err(usage("raw I2C is only supported for Berlin controllers"));
        }
        let dev = I2cDevice::open(&device_str, cli.i2c_addr).map_err(|e| {
            log::error!("{e}");
            EXIT_OPEN
        })?;
        return drive(UpdateEngine::new(dev, variant), cli, variant);
    }

    // Open with the classic layout first; the product code tells us the
    // family, and with it the address width on the wire.
    let mut dev = HidrawDevice::open(&device_str, PacketLayout::CLASSIC).map_err(|e| {
        log::error!("{e}");
        EXIT_OPEN
    })?;
    let variant = match family_from_flags(cli)? {
        Some(family) => family.variant(),
        None => {
            let code = dev.info().product_code();
            ChipFamily::from_pid_code(&code)
                .ok_or_else(|| {
                    log::error!("unrecognized product code {code}; pass --type or --series");
                    EXIT_OPEN
                })?
                .variant()
        }
    };
    log::info!("chip family: {}", variant.name);
    if variant.wide_addr {
        dev.set_layout(PacketLayout::BERLIN);
    }
    drive(UpdateEngine::new(dev, variant), cli, variant)
}

/// Shared tail of every mode: identity query, image load, and the
/// config-only or full update run.
fn drive<T: Transport>(
    mut engine: UpdateEngine<T>,
    cli: &Cli,
    variant: &ChipVariant,
) -> Result<(), u8> {
    if cli.module_id {
        let props = engine.properties().map_err(|e| {
            log::error!("failed to read the device identity: {e}");
            EXIT_OPEN
        })?;
        println!("{}", props.sensor_id);
        return Ok(());
    }

    let image = load_image(cli, variant)?;

    if cli.config_only {
        engine.update_config(&image).map_err(|e| {
            log::error!("config update failed: {e}");
            EXIT_FLASH
        })?;
        println!("config update complete");
        return Ok(());
    }

    let params = UpdateParams {
        force: cli.force,
        subsystem_mask: None,
    };
    match engine.run(&image, &params) {
        Ok(props) => {
            println!(
                "update complete: {} {:X}.{:06X}",
                props.product_id, props.version_major, props.version_minor
            );
            Ok(())
        }
        Err(UpdateError::AlreadyUpToDate) => {
            println!("firmware already up to date");
            Ok(())
        }
        Err(e @ UpdateError::ProductMismatch { .. }) => {
            log::error!("{e}");
            Err(EXIT_ELIGIBILITY)
        }
        Err(e) => {
            log::error!("update failed: {e}");
            Err(EXIT_FLASH)
        }
    }
}

fn load_image(cli: &Cli, variant: &ChipVariant) -> Result<FirmwareImage, u8> {
    let path = cli
        .firmware
        .as_ref()
        .ok_or_else(|| usage("firmware file required"))?;
    FirmwareImage::load(path, variant).map_err(|e| {
        log::error!("cannot load {}: {e}", path.display());
        EXIT_PARSE
    })
}

fn family_from_flags(cli: &Cli) -> Result<Option<ChipFamily>, u8> {
    if let Some(code) = &cli.type_code {
        return ChipFamily::from_pid_code(code)
            .map(Some)
            .ok_or_else(|| usage(&format!("unknown product code {code}")));
    }
    if let Some(series) = &cli.series {
        return ChipFamily::from_series(series)
            .map(Some)
            .ok_or_else(|| usage(&format!("unknown series {series}")));
    }
    Ok(None)
}

/// Emulated controller seeded so the image under test is one version
/// ahead of the device and applies cleanly.
fn emulated_target(family: ChipFamily, image: &FirmwareImage) -> EmulatedIc {
    let minor = image.version_minor();
    let sensor_id = match image.config() {
        Some(ConfigBlock::Legacy { sub_configs, .. }) => {
            sub_configs.first().map(|c| c.sensor_id).unwrap_or(1)
        }
        _ => 1,
    };
    EmulatedIc::new(family)
        .with_identity(Identity {
            pid: image.product_id().to_string(),
            major: 0,
            minor: [0, 0],
            cfg_version: 0,
            sensor_id,
        })
        .after_update(Identity {
            pid: image.product_id().to_string(),
            major: image.version_major() as u8,
            minor: [(minor >> 16) as u8, (minor >> 8) as u8],
            cfg_version: minor as u8,
            sensor_id,
        })
}

fn is_i2c_node(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with("i2c-"))
        .unwrap_or(false)
}

fn usage(msg: &str) -> u8 {
    eprintln!("error: {msg}");
    EXIT_USAGE
}
