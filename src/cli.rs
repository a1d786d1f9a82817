//! CLI argument parsing

use clap::Parser;
use std::path::PathBuf;

/// Parse a 7-bit I2C slave address, hex or decimal
fn parse_i2c_addr(s: &str) -> Result<u16, String> {
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).map_err(|e| format!("invalid hex value: {e}"))?
    } else {
        s.parse::<u16>().map_err(|e| format!("invalid number: {e}"))?
    };
    if value > 0x7F {
        return Err(format!("0x{value:02X} is not a 7-bit address"));
    }
    Ok(value)
}

#[derive(Parser)]
#[command(name = "gtflash")]
#[command(author, version, about = "Firmware update tool for Goodix touch controllers", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Device node (/dev/hidrawN, or /dev/i2c-N for raw-I2C parts)
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Chip type as the 4-digit hex HID product code (e.g. 0EB3).
    /// Auto-detected from the hidraw node when omitted
    #[arg(long = "type", value_name = "PIDCODE")]
    pub type_code: Option<String>,

    /// Chip series name (e.g. 7288, 8589, 7863, 9966)
    #[arg(long, conflicts_with = "type_code")]
    pub series: Option<String>,

    /// Skip the PID and version eligibility checks
    #[arg(long)]
    pub force: bool,

    /// Print the firmware file's PID and version, then exit
    #[arg(long)]
    pub fw_props: bool,

    /// Print the device's sensor (module) id, then exit
    #[arg(long)]
    pub module_id: bool,

    /// Download only the bundled config, leaving the firmware alone
    #[arg(long)]
    pub config_only: bool,

    /// Run the whole update against an in-memory emulated controller
    /// instead of real hardware
    #[arg(long)]
    pub dry_run: bool,

    /// I2C slave address for /dev/i2c-N devices
    #[arg(long, value_parser = parse_i2c_addr, default_value = "0x14")]
    pub i2c_addr: u16,

    /// Firmware image file
    pub firmware: Option<PathBuf>,
}
