use std::path::PathBuf;

use clap::{Parser, Subcommand};

use eth_gas_telemetry::models::{AlertDirection, TimeRange};

#[derive(Parser, Debug)]
#[command(name = "eth-gas-telemetry", version, about = "Ethereum gas market telemetry")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Override bind address, e.g. 0.0.0.0:8080
        #[arg(long)]
        addr: Option<String>,
        /// Also follow the chain head in the background (needs ETH_RPC_URL)
        #[arg(long)]
        follow: bool,
    },
    /// Fetch the last N blocks and store their metrics
    IngestOnce {
        #[arg(long, default_value_t = 5)]
        blocks: u64,
    },
    /// Follow the chain head and ingest every new block
    Watch {
        /// Poll interval override in seconds (ignored when ETH_WS_URL is set)
        #[arg(long)]
        poll_secs: Option<u64>,
    },
    /// Print metrics for a raw block JSON file without storing anything
    Extract { file: PathBuf },
    /// Print the downsampled chart series for a time range
    Series {
        #[arg(long, value_enum, default_value_t = TimeRange::Day)]
        range: TimeRange,
        #[arg(long)]
        max_points: Option<usize>,
    },
    /// Base fee min/max/avg over the last N stored blocks
    GasStats {
        #[arg(long, default_value_t = 10)]
        blocks: u64,
    },
    /// Largest senders by ETH moved in large transfers
    TopWhales {
        #[arg(long, default_value_t = 10)]
        limit: u64,
        #[arg(long, default_value_t = 1)]
        page: u64,
    },
    /// Create a base fee alert
    AlertAdd {
        #[arg(long)]
        name: String,
        /// Threshold in Gwei
        #[arg(long)]
        threshold: f64,
        #[arg(long, value_enum)]
        direction: AlertDirection,
        /// Create the alert switched off
        #[arg(long)]
        disabled: bool,
    },
    /// List alerts
    AlertList,
    /// Enable or disable an alert
    AlertToggle {
        id: String,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Delete an alert and its notifications
    AlertDelete { id: String },
}
