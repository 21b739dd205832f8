// src/main.rs
//! Lumen agent host
//!
//! Runs the agent core as a standalone process. Commands arrive as NDJSON on
//! stdin, one object per line:
//!
//! ```text
//! {"cmd":"enqueue","kind":"performance","payload":{"lcp":1200}}
//! {"cmd":"track","name":"checkout","properties":{"total":42}}
//! {"cmd":"error","message":"boom","stack":null}
//! {"cmd":"identify","user_id":"user_42","traits":{}}
//! {"cmd":"recording","event":{"type":2,"timestamp":1700000000000,"data":{}}}
//! {"cmd":"signal","signal":"visibility_hidden"}
//! ```
//!
//! EOF or Ctrl-C shuts the agent down as if the page were unloading.

use anyhow::{Context, Result};
use lumen_agent::delivery::{HyperTransport, ItemKind};
use lumen_agent::observability::init_tracing;
use lumen_agent::recording::CapturedEvent;
use lumen_agent::session::{KeyValueStore, MemoryStore, SqliteStore};
use lumen_agent::{Agent, AgentConfig, PageSignal};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    Enqueue {
        kind: ItemKind,
        payload: Value,
    },
    Track {
        name: String,
        #[serde(default)]
        properties: Value,
    },
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Identify {
        user_id: String,
        #[serde(default)]
        traits: Value,
    },
    ResetIdentity,
    Recording {
        event: Value,
    },
    Signal {
        signal: PageSignal,
    },
}

fn apply(agent: &Agent, command: Command) {
    match command {
        Command::Enqueue { kind, payload } => agent.enqueue(kind, payload),
        Command::Track { name, properties } => agent.track(&name, properties),
        Command::Error { message, stack } => agent.capture_error(&message, stack.as_deref()),
        Command::Identify { user_id, traits } => {
            agent.identify(&user_id, traits);
        }
        Command::ResetIdentity => agent.reset_identity(),
        Command::Recording { event } => match CapturedEvent::from_wire(event) {
            Some(event) => {
                if agent.recording_feed().push(event).is_err() {
                    debug!("Recording feed full, event dropped");
                }
            }
            None => warn!("Recording event without type or timestamp"),
        },
        Command::Signal { signal } => agent.handle_signal(signal),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging, config.debug)?;

    info!("Starting Lumen agent v{}", lumen_agent::VERSION);

    let durable: Arc<dyn KeyValueStore> = match &config.storage_path {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("Failed to open identity store at {}", path))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let agent = Agent::builder(config)
        .transport(Arc::new(HyperTransport::new()))
        .durable_store(durable)
        .tab_store(Arc::new(MemoryStore::new()))
        .build()?;

    let context = agent.start();
    info!(
        "Session {} for visitor {}",
        context.session_id, context.anonymous_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => match serde_json::from_str::<Command>(&line) {
                        Ok(command) => apply(&agent, command),
                        Err(e) => warn!("Ignoring malformed command: {}", e),
                    },
                    None => {
                        info!("Input closed, shutting down");
                        break;
                    }
                }
            }
        }
    }

    agent.shutdown();
    agent.join().await;

    let stats = agent.stats();
    info!(
        "Agent stopped: {} items enqueued, {} sends, {} beacons, {} failures",
        stats.queue.enqueued, stats.queue.sends, stats.queue.beacons, stats.queue.failures
    );

    Ok(())
}
