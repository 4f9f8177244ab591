use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use micronucleus::firmware::BootloaderConfig;
use micronucleus::transport::LoopbackTransport;
use micronucleus::{EraseStatus, Flashing, Transport, Version};

const PROGRESS_TICKS: u64 = 1000;

#[derive(Parser)]
#[command(
    name = "micronucleus",
    about = "Command-line uploader for the Micronucleus USB bootloader"
)]
struct Cli {
    /// Seconds to wait for the device to be plugged in, 0 waits forever
    #[arg(long, global = true, default_value_t = 0)]
    timeout: u64,

    /// Print every control request
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get info about the connected bootloader
    Info {},
    /// Erase the user region of flash
    Erase {},
    /// Erase, then upload a program to flash
    Flash {
        /// Raw binary, Intel HEX, plain hex or ELF file
        path: String,
        /// Start the program once uploaded
        #[arg(long)]
        run: bool,
        /// Skip the erase, only for freshly erased devices
        #[arg(long)]
        no_erase: bool,
    },
    /// Leave the bootloader and start the uploaded program
    Run {},
    /// Upload to an in-memory device model instead of real hardware
    Simulate {
        path: String,
        /// Bootloader version to emulate
        #[arg(long, default_value = "2.0")]
        device_version: Version,
        /// Start of the bootloader region
        #[arg(long, default_value_t = 0x1800)]
        flash_size: u16,
        #[arg(long, default_value_t = 64)]
        page_size: u8,
    },
}

fn progress_bar(stage: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(PROGRESS_TICKS);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>8} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );
    pb.set_message(stage.to_string());
    Ok(pb)
}

fn erase<T: Transport>(flashing: &mut Flashing<T>, timeout: Option<Duration>) -> Result<()> {
    let pb = progress_bar("Erasing")?;
    let status = flashing.erase_flash(|p| pb.set_position((p * PROGRESS_TICKS as f32) as u64))?;
    pb.finish();
    if status == EraseStatus::Disconnected {
        log::info!("Reconnecting to device...");
        flashing.reconnect(timeout)?;
    }
    Ok(())
}

fn write<T: Transport>(flashing: &mut Flashing<T>, image: &[u8]) -> Result<()> {
    let pb = progress_bar("Writing")?;
    flashing.write_flash(image, |p| pb.set_position((p * PROGRESS_TICKS as f32) as u64))?;
    pb.finish();
    Ok(())
}

fn upload<T: Transport>(
    flashing: &mut Flashing<T>,
    image: &[u8],
    no_erase: bool,
    timeout: Option<Duration>,
) -> Result<()> {
    let flash_size = flashing.info().flash_size as usize;
    if image.len() > flash_size {
        anyhow::bail!(
            "Program file is {} bytes too big for the bootloader",
            image.len() - flash_size
        );
    }
    if !no_erase {
        erase(flashing, timeout)?;
    }
    write(flashing, image)?;
    log::info!("Micronucleus done. Thank you!");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let timeout = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));

    match cli.command {
        Commands::Simulate {
            path,
            device_version,
            flash_size,
            page_size,
        } => {
            let config = BootloaderConfig::new(
                device_version,
                flash_size,
                page_size,
                BootloaderConfig::default().write_sleep_ms,
            )?;
            let image = micronucleus::format::read_firmware_from_file(path)?;
            log::info!("Program size: {} bytes", image.len());
            let mut flashing = Flashing::connect(LoopbackTransport::new(config)?)?;
            flashing.dump_info()?;
            upload(&mut flashing, &image, false, timeout)?;
            flashing.start_app()?;
            let transport = flashing.into_transport();
            log::info!(
                "Device model received {} requests, {} page writes",
                transport.requests().len(),
                transport.flash().page_writes()
            );
        }
        Commands::Info {} => {
            let flashing = Flashing::new_from_usb(timeout)?;
            flashing.dump_info()?;
        }
        Commands::Erase {} => {
            let mut flashing = Flashing::new_from_usb(timeout)?;
            erase(&mut flashing, timeout)?;
        }
        Commands::Flash {
            path,
            run,
            no_erase,
        } => {
            // parse before waiting on the device
            let image = micronucleus::format::read_firmware_from_file(path)?;
            log::info!("Program size: {} bytes", image.len());
            let mut flashing = Flashing::new_from_usb(timeout)?;
            flashing.dump_info()?;
            upload(&mut flashing, &image, no_erase, timeout)?;
            if run {
                flashing.start_app()?;
            }
        }
        Commands::Run {} => {
            let mut flashing = Flashing::new_from_usb(timeout)?;
            flashing.start_app()?;
        }
    }

    Ok(())
}
