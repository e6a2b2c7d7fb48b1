//! partymap command-line entrypoint.
//!
//! `relay` hosts the fan-out server; `run` connects a syncing client and
//! keeps it alive until interrupted; `add` / `list` / `delete` operate on
//! the local pin database directly (edits made offline are pushed the next
//! time `run` connects).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use partymap::{
    ChangeNotifier, Config, MapRelay, PinCategory, PinDraft, PinId, PinStore, RelayTransport,
    SyncEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "partymap", version, about = "Shared party-map pin sync over a websocket relay")]
struct Cli {
    /// Config file path (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the fan-out relay that clients connect to.
    Relay {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:9777")]
        bind: String,
    },
    /// Connect to the relay and sync until interrupted.
    Run {
        /// Identity stamped on pins created this session (overrides config).
        #[arg(long)]
        author: Option<String>,
    },
    /// Add a pin to the local map.
    Add {
        lat: f64,
        lng: f64,
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// location | quest | danger | safe | resource | other
        #[arg(long, default_value = "location")]
        category: String,
        #[arg(long)]
        author: Option<String>,
    },
    /// List pins on the local map.
    List {
        /// Include tombstones of deleted pins.
        #[arg(long)]
        all: bool,
    },
    /// Delete a pin by id.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Command::Relay { bind } => run_relay(&bind).await,
        Command::Run { author } => run_client(config, author).await,
        Command::Add {
            lat,
            lng,
            name,
            description,
            category,
            author,
        } => {
            let category: PinCategory = match category.parse() {
                Ok(c) => c,
                Err(e) => bail!("{e}"),
            };
            let store = open_store(&config)?;
            let author = author.or_else(|| config.author.clone());
            let pin = store.create(
                PinDraft {
                    lat,
                    lng,
                    name,
                    description,
                    category,
                },
                author.as_deref(),
            )?;
            println!("{} {}", pin.id, pin.name);
            Ok(())
        }
        Command::List { all } => {
            let store = open_store(&config)?;
            let pins = if all { store.list()? } else { store.list_live()? };
            for pin in &pins {
                let marker = if pin.deleted { " [deleted]" } else { "" };
                println!(
                    "{}  {:<10} {:>9.4},{:>9.4}  {} ({}){}",
                    pin.id, pin.category, pin.lat, pin.lng, pin.name, pin.author, marker
                );
            }
            if pins.is_empty() {
                println!("no pins");
            }
            Ok(())
        }
        Command::Delete { id } => {
            let id: PinId = id.parse().context("invalid pin id")?;
            let store = open_store(&config)?;
            let pin = store.delete(&id)?;
            println!("deleted {} {}", pin.id, pin.name);
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<PinStore>> {
    let path = config.db_path()?;
    Ok(Arc::new(PinStore::open(&path, config.retention_ms())?))
}

async fn run_relay(bind: &str) -> Result<()> {
    let relay = MapRelay::bind(bind)
        .await
        .with_context(|| format!("binding relay to {bind}"))?;
    tracing::info!(addr = %relay.local_addr()?, "relay listening");
    tokio::select! {
        _ = relay.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down relay");
        }
    }
    Ok(())
}

async fn run_client(config: Config, author: Option<String>) -> Result<()> {
    config.validate()?;
    let store = open_store(&config)?;
    let transport = RelayTransport::new(config.relay_url.clone(), config.backoff());
    let notifier = ChangeNotifier::new();
    let author = author.or_else(|| config.author.clone());

    let engine = SyncEngine::new(
        store.clone(),
        transport.clone(),
        notifier.clone(),
        author,
        config.debounce(),
    );
    engine.start()?;

    // Log what the map looks like whenever it changes.
    let view = store.clone();
    let _sub = notifier.on_change(move || match view.list_live() {
        Ok(pins) => tracing::info!(pins = pins.len(), "map updated"),
        Err(err) => tracing::warn!(error = %err, "failed to read map"),
    });

    transport.connect();
    tracing::info!(relay = %config.relay_url, "syncing, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    engine.stop();
    transport.shutdown();
    Ok(())
}
