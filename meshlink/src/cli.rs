use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Serial port (e.g., /dev/ttyUSB0)
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Bluetooth device name or MAC address
    #[arg(short = 'b', long, global = true)]
    pub ble: Option<String>,

    /// Output in JSON format
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Scan/connect timeout (e.g., 10s, 1m)
    #[arg(short = 't', long, global = true, default_value = "10s")]
    pub timeout: humantime::Duration,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover nearby radios
    Scan,

    /// Connect to a radio and print incoming messages, reconnecting on
    /// unexpected drops
    Listen {
        /// Dispatch desktop-style notification lines for incoming messages
        #[arg(long)]
        notify: bool,
    },

    /// Send a text message
    Send {
        /// Message text
        text: String,

        /// Destination node number (hex, e.g. a4c138f0); broadcast if omitted
        #[arg(short = 'D', long)]
        dest: Option<String>,

        /// Channel index
        #[arg(short = 'c', long, default_value = "0")]
        channel: u32,
    },
}
