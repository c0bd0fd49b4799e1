use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use weave_crypto::{GroupPolicy, Identity};
use weave_protocol::{
    CoreConfig, LoopbackNetwork, MemoryFileSource, NodeEvent, NodeStorage, PeerNode,
    SignalingEvent,
};

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Command-line arguments for the daemon.
struct Args {
    config_path: Option<String>,
    /// Keep both peers running until Ctrl-C after the walkthrough.
    stay_up: bool,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut stay_up = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--stay-up" => stay_up = true,
            other => tracing::warn!(arg = other, "unknown argument ignored"),
        }
    }
    Args {
        config_path,
        stay_up,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("weave-node starting");

    let args = parse_args();
    let config = match &args.config_path {
        Some(path) => CoreConfig::from_json_file(path).with_context(|| format!("loading {path}"))?,
        None => CoreConfig::default(),
    };

    let network = LoopbackNetwork::new();
    let alice_files = Arc::new(MemoryFileSource::default());
    let bob_files = Arc::new(MemoryFileSource::default());
    let (alice, mut alice_events) = start_peer(&network, &config, &alice_files)?;
    let (bob, mut bob_events) = start_peer(&network, &config, &bob_files)?;
    tracing::info!(alice = %alice.did(), bob = %bob.did(), "peers online");

    // 1. Session
    alice.establish_session(&bob.did()).await?;

    // 2. Group
    alice
        .create_group("demo", "demo group", &[bob.did()], GroupPolicy::default())
        .await?;
    wait_for(&mut bob_events.node, |e| matches!(e, NodeEvent::GroupKeyInstalled { .. })).await?;
    bob.send_group_message("demo", b"hello from bob").await?;
    if let NodeEvent::GroupMessage { sender, plaintext, .. } =
        wait_for(&mut alice_events.node, |e| matches!(e, NodeEvent::GroupMessage { .. })).await?
    {
        tracing::info!(sender = %sender, text = %String::from_utf8_lossy(&plaintext), "group message delivered");
    }

    // 3. File pull
    let content = b"weave keeps the threads together\n".repeat(4096);
    bob_files.insert("readme", "README.txt", "text/plain", "documents", 0, content.clone());
    let received = alice.request_file(&bob.did(), "readme").await?.finished().await?;
    if received.data != content {
        bail!("pulled file does not match what bob served");
    }
    tracing::info!(
        name = %received.metadata.name,
        bytes = received.data.len(),
        chunks = received.metadata.total_chunks,
        "file pulled"
    );

    // 4. Call signaling
    alice.signaling().send_offer(&bob.did(), "v=0\r\n").await?;
    wait_for(&mut bob_events.signaling, |e| matches!(e, SignalingEvent::OfferReceived { .. })).await?;
    bob.signaling().send_answer(&alice.did(), "v=0\r\n").await?;
    wait_for(&mut alice_events.signaling, |e| matches!(e, SignalingEvent::AnswerReceived { .. })).await?;
    tracing::info!(state = ?alice.signaling().state(&bob.did()), "call connected");
    alice.signaling().send_hangup(&bob.did(), None).await?;

    if args.stay_up {
        tracing::info!("weave-node ready, Ctrl-C to stop");
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    }

    tracing::info!("weave-node shutting down");
    alice.shutdown().await;
    bob.shutdown().await;
    tracing::info!("weave-node stopped");
    Ok(())
}

fn start_peer(
    network: &Arc<LoopbackNetwork>,
    config: &CoreConfig,
    files: &Arc<MemoryFileSource>,
) -> anyhow::Result<(PeerNode, weave_protocol::NodeEvents)> {
    let identity = Arc::new(Identity::generate()?);
    let (transport, inbox) = network.register(&identity.did());
    let storage = NodeStorage {
        files: Arc::clone(files) as _,
        ..NodeStorage::default()
    };
    Ok(PeerNode::start(identity, transport, inbox, config.clone(), storage)?)
}

async fn wait_for<T>(rx: &mut mpsc::Receiver<T>, pred: impl Fn(&T) -> bool) -> anyhow::Result<T> {
    let wait = async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Ok(event);
            }
        }
        bail!("event channel closed")
    };
    tokio::time::timeout(EVENT_WAIT, wait)
        .await
        .context("timed out waiting for an event")?
}
