//! RingNet overlay peer daemon.

mod cli;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use ringnet_crypto::{CryptoError, Identity, IdentityPaths};
use ringnet_overlay::{
    Candidate, Overlay, OverlayConfig, OverlayError, OverlayEvent, TlsIdentity,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::cli::Cli;

#[derive(Debug, Error)]
enum NodeError {
    #[error("identity error: {0}")]
    Identity(#[from] CryptoError),
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let identity = Identity::load(&IdentityPaths {
        private_key: cli.private_key.clone(),
        public_key: cli.public_key.clone(),
        ring_public_key: cli.ring_public_key.clone(),
        signature: cli.signature.clone(),
    })?;
    info!("identity loaded ({})", BASE64.encode(identity.ring_signature()));

    let mut config = OverlayConfig {
        public_address: cli.public_address.clone(),
        discovery_addresses: cli
            .discovery_addresses
            .iter()
            .map(|a| Candidate::new(a.clone(), None))
            .collect(),
        discovery_range: Some(cli.discovery_range),
        start_discovery: !cli.no_discovery,
        require_confirmation: cli.require_confirmation,
        ..OverlayConfig::default()
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let (Some(cert), Some(key)) = (cli.cert.clone(), cli.tls_key.clone()) {
        config.tls = Some(TlsIdentity { cert, key });
    }

    let mut overlay = Overlay::new(config, identity);
    let mut events = overlay.take_events().expect("fresh overlay");
    overlay.start().await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => log_event(event),
                    None => break,
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("signal handler failed: {}", e);
                }
                info!("shutting down");
                overlay.close().await;
                break;
            }
        }
    }

    Ok(())
}

fn log_event(event: OverlayEvent) {
    match event {
        OverlayEvent::Ready { port } => info!("ready on port {}", port),
        OverlayEvent::Discovering => info!("discovering peers"),
        OverlayEvent::Discovered => info!("discovery pass complete"),
        OverlayEvent::Request { remote_addr } => info!("connection request from {}", remote_addr),
        OverlayEvent::Connection { signature } => {
            info!("peer trusted ({})", BASE64.encode(signature))
        }
        OverlayEvent::Message(delivery) => {
            info!(
                "{} message from {}: {}",
                delivery.kind,
                BASE64.encode(&delivery.from),
                delivery.body
            )
        }
    }
}
