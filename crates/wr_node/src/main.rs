//! Reference node runner for the Warren secure link layer.
//!
//! `keygen` writes a fresh identity; `run` binds a UDP socket, loads a
//! static peer directory, connects to every listed peer and either logs
//! or echoes whatever arrives. This is collaborator wiring only; all
//! protocol behaviour lives in `wr_link`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wr_crypto::SigningIdentity;
use wr_link::{LinkConfig, LinkNode, Priority, SystemClock};

mod directory;
mod udp;

use directory::StaticDirectory;
use udp::UdpTransport;

#[derive(Parser, Debug)]
#[command(author, version, about = "Warren secure link reference node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a node identity and write the secret to a file.
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },
    /// Run a node.
    Run {
        /// UDP listen address.
        #[arg(long)]
        listen: SocketAddr,
        /// Path to the identity secret written by `keygen`.
        #[arg(long)]
        identity: PathBuf,
        /// Path to the JSON peers file.
        #[arg(long)]
        peers: PathBuf,
        /// Opaque node reference carried in the handshake payload.
        #[arg(long, default_value = "wr-node")]
        reference: String,
        /// Echo every received message back to its sender.
        #[arg(long)]
        echo: bool,
    },
}

fn save_identity(path: &Path, identity: &SigningIdentity) -> Result<()> {
    std::fs::write(path, hex::encode(identity.secret_bytes()))
        .with_context(|| format!("writing identity to {}", path.display()))
}

fn load_identity(path: &Path) -> Result<SigningIdentity> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading identity from {}", path.display()))?;
    let secret = hex::decode(raw.trim()).context("identity file is not hex")?;
    SigningIdentity::from_bytes(&secret).map_err(|e| anyhow::anyhow!("bad identity key: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Commands::Keygen { out } => {
            let identity = SigningIdentity::generate();
            save_identity(&out, &identity)?;
            println!("public key: {}", hex::encode(identity.public_bytes()));
            println!("identity hash: {}", hex::encode(identity.identity_hash()));
            Ok(())
        }
        Commands::Run {
            listen,
            identity,
            peers,
            reference,
            echo,
        } => run(listen, &identity, &peers, reference.into_bytes(), echo).await,
    }
}

async fn run(
    listen: SocketAddr,
    identity_path: &Path,
    peers_path: &Path,
    reference: Vec<u8>,
    echo: bool,
) -> Result<()> {
    let identity = load_identity(identity_path)?;
    info!(
        identity = %hex::encode(&identity.identity_hash()[..8]),
        "identity loaded"
    );

    let directory = Arc::new(StaticDirectory::load(peers_path)?);
    let transport = Arc::new(UdpTransport::bind(listen)?);

    let node = Arc::new(
        LinkNode::new(
            LinkConfig::default(),
            identity,
            reference,
            transport.clone(),
            directory.clone(),
            Arc::new(SystemClock::new()),
        )
        .map_err(|e| anyhow::anyhow!("building node: {e}"))?,
    );

    let _pump = transport.spawn_receive_pump(node.clone())?;
    let _tasks = node.start();

    // Messages are echoed from a task fed by the per-peer callbacks, so
    // the callbacks themselves hold no handle back into the node.
    let (echo_tx, mut echo_rx) = tokio::sync::mpsc::unbounded_channel::<(wr_link::PeerId, Vec<u8>)>();

    for info in directory.all() {
        let peer = node.register_peer(info);
        let address = peer.info().address;
        let tx = echo_tx.clone();
        let id = peer.id();
        peer.on_message(move |message| {
            info!(peer = %address, len = message.len(), "message received");
            if echo {
                let _ = tx.send((id, message.to_vec()));
            }
        });
        peer.connect();
    }
    drop(echo_tx);

    let echo_node = node.clone();
    let echoer = tokio::spawn(async move {
        while let Some((peer_id, message)) = echo_rx.recv().await {
            if let Some(peer) = echo_node.peer(peer_id) {
                if let Err(err) = peer.send(message, Priority::Normal) {
                    warn!(%peer_id, %err, "echo send failed");
                }
            }
        }
    });

    info!("node running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    node.shutdown();
    echoer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.hex");
        let identity = SigningIdentity::generate();
        save_identity(&path, &identity).unwrap();
        let restored = load_identity(&path).unwrap();
        assert_eq!(identity.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn load_identity_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.hex");
        std::fs::write(&path, "not hex at all").unwrap();
        assert!(load_identity(&path).is_err());
    }
}
