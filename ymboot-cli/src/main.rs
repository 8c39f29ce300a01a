//! Command-line tool for YModem firmware transfer and runtime updates.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use ymboot::{
    Frame, MemFlash, Modem, ModemConfig, NativePort, ReceiverConfig, SerialConfig,
    TransmitterConfig, YmodemReceiver, YmodemTransmitter, layout, send_request,
};

#[derive(Parser)]
#[command(name = "ymboot", version, about = "YModem firmware transfer tool")]
struct Cli {
    /// Serial port (e.g., /dev/ttyUSB0, COM3)
    #[arg(short, long, global = true, env = "YMBOOT_PORT", default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate
    #[arg(short, long, global = true, env = "YMBOOT_BAUD", default_value_t = 115200)]
    baud: u32,

    /// Verbose output (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a firmware image to a device waiting in download mode
    Send {
        /// Image file to send
        file: PathBuf,

        /// Filename reported in the header packet (defaults to the file's name)
        #[arg(long)]
        name: Option<String>,

        /// Target region capacity; bounds the packet count (e.g. 1m, 0x100000)
        #[arg(long, default_value = "1m", value_parser = parse_size_arg)]
        capacity: u64,
    },

    /// Receive a firmware image and write it to a file
    Recv {
        /// Output file
        out: PathBuf,

        /// Capacity of the simulated target region (e.g. 1m, 512k)
        #[arg(long, default_value = "1m", value_parser = parse_size_arg)]
        capacity: u64,
    },

    /// Run the device-side runtime update dispatcher until an upgrade is
    /// scheduled or the inactivity window lapses
    Listen {
        /// Inactivity window in seconds
        #[arg(long, default_value_t = 30)]
        window: u64,
    },

    /// Ask a running device to schedule a firmware upgrade and reset
    Upgrade,
}

fn parse_size_arg(s: &str) -> std::result::Result<u64, String> {
    ymboot::parse_size(s).ok_or_else(|| format!("invalid size '{s}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = SerialConfig::new(&cli.port, cli.baud).with_timeout(Duration::from_millis(1000));

    match cli.command {
        Commands::Send { file, name, capacity } => {
            // Read the image before touching the port: a bad path should not
            // leave the device waiting on a half-opened link.
            let data = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let name = name.unwrap_or_else(|| {
                file.file_name()
                    .map_or_else(|| "firmware.bin".into(), |n| n.to_string_lossy().into_owned())
            });
            let mut port = open_port(&config)?;

            info!("Sending {} ({} bytes) as '{}'", file.display(), data.len(), name);
            info!("Waiting for the receiver to request the transfer...");

            let bar = progress_bar(data.len() as u64);
            let tx_config = TransmitterConfig {
                max_packets: (capacity / 1024).max(1) as u32,
                ..TransmitterConfig::default()
            };
            let mut tx = YmodemTransmitter::new(&mut port, tx_config);
            tx.transmit(&name, &data, |sent, _| bar.set_position(sent as u64))?;
            bar.finish();

            info!("Transfer complete");
        },

        Commands::Recv { out, capacity } => {
            let mut port = open_port(&config)?;
            info!("Waiting for a sender on {}...", cli.port);

            let mut flash = MemFlash::new(layout::DEFAULT_APP_BASE, capacity as usize);
            let rx_config = ReceiverConfig {
                base_addr: layout::DEFAULT_APP_BASE,
                capacity,
                marker_addr: None,
                ..ReceiverConfig::default()
            };
            let file_info = YmodemReceiver::new(&mut port, &mut flash, rx_config).receive()?;

            let size = usize::try_from(file_info.size).context("declared size overflows")?;
            std::fs::write(&out, &flash.data()[..size])
                .with_context(|| format!("failed to write {}", out.display()))?;

            info!(
                "Received '{}' ({} bytes) -> {}",
                file_info.name,
                file_info.size,
                out.display()
            );
        },

        Commands::Listen { window } => {
            let mut port = open_port(&config)?;
            info!("Serving runtime update channel on {}...", cli.port);

            let mut flash = MemFlash::new(
                layout::DEFAULT_UPGRADE_FLAG_ADDR & !0xFFF,
                4096,
            );
            let modem_config = ModemConfig {
                window: Duration::from_secs(window),
                ..ModemConfig::default()
            };
            Modem::new(&mut port, &mut flash, modem_config)
                .with_reset(|| info!("(device would reset into the bootloader here)"))
                .process()?;

            info!("Upgrade scheduled");
        },

        Commands::Upgrade => {
            let mut port = open_port(&config)?;
            let timeout = Duration::from_secs(2);
            check_result(
                "handshake",
                send_request(&mut port, &Frame::handshake(1), timeout)?,
            )?;
            info!("Handshake OK");

            check_result(
                "upgrade",
                send_request(&mut port, &Frame::schedule_upgrade(2), timeout)?,
            )?;
            info!("Upgrade scheduled; device is resetting into the bootloader");
        },
    }

    Ok(())
}

fn open_port(config: &SerialConfig) -> Result<NativePort> {
    NativePort::open(config)
        .with_context(|| format!("failed to open serial port {}", config.port_name))
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    bar
}

fn check_result(what: &str, result: u8) -> Result<()> {
    if result != ymboot::protocol::frame::RESULT_OK {
        bail!("device rejected {what} (result {result:#04x})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_arg() {
        assert_eq!(parse_size_arg("2000"), Ok(2000));
        assert_eq!(parse_size_arg("1m"), Ok(1 << 20));
        assert!(parse_size_arg("nope").is_err());
    }
}
