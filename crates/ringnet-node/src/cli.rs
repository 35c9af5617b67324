//! Command-line interface

use std::path::PathBuf;

use clap::Parser;
use ringnet_overlay::DEFAULT_DISCOVERY_RANGE;

/// RingNet overlay peer
#[derive(Debug, Parser)]
#[command(name = "ringnet-node")]
#[command(version)]
#[command(about = "Run a RingNet overlay peer", long_about = None)]
pub struct Cli {
    /// Listen port (defaults to $RINGNET_LISTEN or 26781; 0 for ephemeral)
    #[arg(long)]
    pub port: Option<u16>,

    /// Address advertised to peers
    #[arg(long)]
    pub public_address: Option<String>,

    /// Initial discovery candidate (repeatable)
    #[arg(long = "discover", value_name = "ADDRESS")]
    pub discovery_addresses: Vec<String>,

    /// Port-expansion range for port-less candidates, as LO-HI
    #[arg(long, value_parser = parse_range, default_value = default_range())]
    pub discovery_range: (u16, u16),


    /// Do not start discovery at startup
    #[arg(long)]
    pub no_discovery: bool,

    /// Demand per-message confirmation and retry until confirmed
    #[arg(long)]
    pub require_confirmation: bool,

    /// Private key PEM file (generated when missing)
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Public key PEM file (derived from the private key when missing)
    #[arg(long)]
    pub public_key: Option<PathBuf>,

    /// Ring authority public key PEM file
    #[arg(long, value_name = "FILE")]
    pub ring_public_key: PathBuf,

    /// Ring signature file (base64) over this peer's public key
    #[arg(long, value_name = "FILE")]
    pub signature: PathBuf,

    /// TLS certificate PEM for the listener (plain ws when absent)
    #[arg(long, requires = "tls_key")]
    pub cert: Option<PathBuf>,

    /// TLS private key PEM for the listener
    #[arg(long, requires = "cert")]
    pub tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn default_range() -> String {
    format!(
        "{}-{}",
        DEFAULT_DISCOVERY_RANGE.0, DEFAULT_DISCOVERY_RANGE.1
    )
}

fn parse_range(value: &str) -> Result<(u16, u16), String> {
    let (lo, hi) = value
        .split_once('-')
        .ok_or_else(|| "expected LO-HI".to_string())?;
    let lo: u16 = lo.trim().parse().map_err(|_| "invalid low port")?;
    let hi: u16 = hi.trim().parse().map_err(|_| "invalid high port")?;
    if lo > hi {
        return Err("low port exceeds high port".to_string());
    }
    Ok((lo, hi))
}
