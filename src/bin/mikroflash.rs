//! mikroflash - flash Intel HEX images into PIC32 devices running the mikroBootloader

use std::path::PathBuf;
use std::process;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mikroflash::{
    read_boot_info, BootVectorPolicy, ChecksumPolicy, Context, Error, Operation, ProtocolEngine,
    RegionBuilder, TargetConfig, PRODUCT_ID, VENDOR_ID,
};

/// Parse a string as a hex or decimal u16
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u16>().map_err(|e| format!("Invalid number: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "mikroflash")]
#[command(author, version, about = "USB HID flasher for the PIC32 mikroBootloader", long_about = None)]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// USB vendor ID of the bootloader
    #[arg(long, value_parser = parse_hex_u16, default_value_t = VENDOR_ID)]
    vid: u16,

    /// USB product ID of the bootloader
    #[arg(long, value_parser = parse_hex_u16, default_value_t = PRODUCT_ID)]
    pid: u16,

    /// Reject hex records with a wrong checksum
    #[arg(long)]
    verify_checksums: bool,

    /// Also write the boot vector page near the end of program flash
    #[arg(long)]
    write_boot_vector: bool,

    /// Only print what the bootloader reports about the device
    #[arg(long)]
    info: bool,

    /// Intel HEX file to flash
    #[arg(required_unless_present = "info")]
    hex_file: Option<PathBuf>,
}

/// Log filter for the given number of `-v` flags
fn log_level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn logger(verbose: u8) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level(verbose));
    builder
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG still overrides the level picked by -v
    logger(cli.verbose).parse_default_env().init();

    if let Err(e) = run(&cli) {
        // Transport errors already name the protocol state and region
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let mut config = TargetConfig::default();
    if cli.verify_checksums {
        config.checksum = ChecksumPolicy::Verify;
    }
    if cli.write_boot_vector {
        config.boot_vector_page = BootVectorPolicy::Enabled;
    }

    // Parse the image first so a bad file never touches the device
    let image = match &cli.hex_file {
        Some(path) if !cli.info => {
            let image = RegionBuilder::new(&config).build_file(path)?;
            for region in image.regions() {
                log::info!(
                    "{}: 0x{:08x}..=0x{:08x} ({} bytes)",
                    region.kind(),
                    region.start(),
                    region.end(),
                    region.len()
                );
            }
            Some(image)
        }
        _ => None,
    };

    let context = Context::new()?;
    let mut transport = context.open(cli.vid, cli.pid)?;

    let image = match image {
        Some(image) => image,
        None => {
            let info = read_boot_info(&mut transport)?;
            println!("{}", info);
            return Ok(());
        }
    };

    let mut engine = ProtocolEngine::with_image(transport, &config, image)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    while let Some(progress) = engine.next() {
        let progress = match progress {
            Ok(progress) => progress,
            Err(e) => {
                pb.abandon();
                return Err(e);
            }
        };
        pb.set_length(engine.total());
        pb.set_position(progress.written);
        pb.set_message(format!("{} (region {})", progress.state, progress.region));
    }
    pb.finish_with_message("done");

    Ok(())
}
