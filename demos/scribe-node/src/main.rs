//! Example node driving the scribe core against a running daemon.
//!
//! Run with: cargo run -p scribe-node -- <listen|add> [config.json]
//!
//! The daemon must already be running with pubsub enabled, e.g.
//! `ipfs daemon --enable-pubsub-experiment`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use scribe_backend::{ListenerConfig, Node, NodeError, storage::KuboStore};
use scribe_core::{ContentId, ScribeConfig};
use scribe_records::{Project, ProjectDatabase, RecordError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_default();
    let config = match args.next() {
        Some(path) => load_config(Path::new(&path))?,
        None => ScribeConfig::default(),
    };

    let node = init_node(&config).await?;
    match command.as_str() {
        "listen" => listen(&node, &config).await,
        "add" => add(&node, &config).await,
        other => bail!("unrecognised command ({other}), use either listen|add"),
    }
}

fn load_config(path: &Path) -> Result<ScribeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

async fn init_node(config: &ScribeConfig) -> Result<Node<KuboStore>> {
    tracing::info!("initialising the node...");
    let node = match Node::init(KuboStore::from_config(config)).await {
        Ok(node) => node,
        Err(NodeError::Offline) => {
            bail!("daemon is not reachable on {}", config.api_address)
        }
        Err(e) => return Err(e.into()),
    };
    let identity = node.identity().await?;
    tracing::info!("API server listening on: {}", node.store().api_url());
    tracing::info!("node identity: {}", identity.id);
    Ok(node)
}

async fn listen(node: &Node<KuboStore>, config: &ScribeConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    node.subscribe(&cancel, &config.project).await?;
    tracing::info!("listening for: {}", config.project);

    let mut listener = node.listen(ListenerConfig::default())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
            item = listener.recv() => match item {
                Some(Ok(msg)) => {
                    tracing::info!("message received from: {}", msg.from);
                    tracing::info!("content: {}", msg.text().unwrap_or("<binary>"));
                }
                Some(Err(e)) => tracing::warn!("{e}"),
                None => break,
            },
        }
    }

    listener.stop().await;
    node.unsubscribe().await?;
    Ok(())
}

async fn add(node: &Node<KuboStore>, config: &ScribeConfig) -> Result<()> {
    node.set_project(config.project.as_str())?;
    tracing::info!("registered node with project: {}", config.project);

    let mut db = ProjectDatabase::with_config(config);
    if let Some(remote) = config.remote_cid() {
        tracing::info!("pulling project database {remote}...");
        db.pull(node, &ContentId::new(remote)).await?;
        tracing::info!("number of projects in local database: {}", db.num_projects());
    } else {
        tracing::info!("no existing database id found");
    }

    let existing = db
        .get_project(&config.project)
        .map(|project| project.label().to_string());
    match existing {
        Ok(label) => tracing::info!("project found: {label}"),
        Err(RecordError::NotFound(_)) => {
            tracing::info!("project not found for {}, creating it", config.project);
            let mut project = Project::new(config.project.as_str());
            project.register(node, db.pin()).await?;
            db.add_project(project)?;
            let cid = db.push(node).await?;
            tracing::info!("database id updated: {cid}, set remoteCid in the config to keep it");
        }
        Err(e) => return Err(e.into()),
    }

    node.publish("just loaded the project over here...").await?;
    Ok(())
}
