// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// XMODEM-CRC file transfer
mod config;
mod crc16;
mod error;
mod protocol;
mod sender;
mod receiver;
mod serial;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use config::{parse_data_bits, parse_parity, parse_stop_bits, RetryLimit, SerialSettings, ThreadPacer, TransferConfig};
use serial::RealSerialPort;

#[derive(Parser)]
#[command(name = "xmodem", version)]
#[command(about = "XMODEM-CRC file transfer over a serial port", long_about = None)]
#[command(disable_help_subcommand = true, arg_required_else_help = true)]
struct Cli {
    /// Baud rate
    #[arg(short, long, default_value = "9600", global = true)]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS", global = true)]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none", global = true)]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS", global = true)]
    stop_bits: u8,

    /// Header or CRC failures tolerated per packet when receiving
    #[arg(long, default_value = "3", value_name = "COUNT", global = true,
          value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: u32,

    /// Failed attempts allowed per packet when sending (unlimited if omitted)
    #[arg(long, value_name = "COUNT", global = true,
          value_parser = clap::value_parser!(u32).range(1..))]
    sender_retries: Option<u32>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// File to send
        file: PathBuf,
        /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
        port: String,
    },
    /// Receive a file
    Receive {
        /// Where to write the received file
        file: PathBuf,
        /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
        port: String,
    },
}

impl Cli {
    fn port(&self) -> &str {
        match &self.command {
            Commands::Send { port, .. } | Commands::Receive { port, .. } => port,
        }
    }

    fn serial_settings(&self) -> Result<SerialSettings, String> {
        let mut settings = SerialSettings::new(self.port());
        settings.baud_rate = self.baud;
        settings.data_bits = parse_data_bits(self.data_bits)?;
        settings.parity = parse_parity(&self.parity)?;
        settings.stop_bits = parse_stop_bits(self.stop_bits)?;
        Ok(settings)
    }

    fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            sender_retries: self.sender_retries.map_or(RetryLimit::Unbounded, RetryLimit::Attempts),
            receiver_retries: self.max_retries,
            ..TransferConfig::default()
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_logging(cli.debug);

    let settings = match cli.serial_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, settings) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli, settings: SerialSettings) -> error::Result<()> {
    let config = cli.transfer_config();

    info!("Opening serial port: {}", settings.port);
    info!(
        "Settings: {} baud, {:?}, {:?}, {:?}",
        settings.baud_rate, settings.data_bits, settings.parity, settings.stop_bits
    );
    let serial_port = RealSerialPort::open(&settings)?;

    match cli.command {
        Commands::Send { file, .. } => {
            info!("Sending file: {}", file.display());
            sender::send_file(Box::new(serial_port), &file, config)?;
            info!("File sent successfully");
        }
        Commands::Receive { file, .. } => {
            info!("Receiving file: {}", file.display());
            receiver::receive_file(Box::new(serial_port), &file, config, Box::new(ThreadPacer))?;
            info!("File received successfully");
        }
    }

    Ok(())
}
