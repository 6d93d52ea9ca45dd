#[macro_use]
extern crate log;

use std::convert::TryInto;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use structopt::StructOpt;

use simplelog::{Config, LevelFilter, SimpleLogger};

use indicatif::{ProgressBar, ProgressStyle};

use stm32_gpio_flasher::{image_write_len, protocol::MAX_CHUNK, Flasher, Options};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Firmware image to flash (raw binary)
    #[structopt(parse(from_os_str))]
    firmware: PathBuf,

    /// Flash base address
    #[structopt(long, default_value = "0x08000000", parse(try_from_str = parse_address))]
    address: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

/// Parse a hex flash address, with or without the 0x prefix.
fn parse_address(s: &str) -> anyhow::Result<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    let padded = format!("{:0>8}", digits);
    let bytes = hex::decode(&padded).context("address must be hexadecimal")?;
    let bytes: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .context("address must fit in 32 bits")?;
    Ok(u32::from_be_bytes(bytes))
}

fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    let _ = SimpleLogger::init(args.log_level, Config::default());

    let firmware = fs::read(&args.firmware).with_context(|| {
        format!("Failed to read firmware image `{}`", args.firmware.display())
    })?;
    info!(
        "loaded `{}` ({})",
        args.firmware.display(),
        bytefmt::format(firmware.len() as u64)
    );

    let mut flasher = Flasher::linux(args.options);

    let bar = ProgressBar::new(image_write_len(firmware.len()) as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );

    flasher
        .flash_with_progress(args.address, &firmware, |p| {
            bar.set_position((p.offset + MAX_CHUNK).min(p.total) as u64);
        })
        .context("Flashing failed")?;
    bar.finish();

    info!(
        "flashed {} bytes at 0x{:08x}",
        firmware.len(),
        args.address
    );

    Ok(())
}
