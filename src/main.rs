// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use pdud::action::{ClientId, CompletedAction};
use pdud::config::{ClusterSpec, DaemonConfig};
use pdud::engine::{ClientSink, Engine};

/// Logs every completed action at info level. The real client-facing wire
/// listener (and the liveness bookkeeping a multi-client one needs) is out
/// of scope (spec §1); this sink exists so the daemon is independently
/// runnable and observable without one.
struct LoggingSink;

impl ClientSink for LoggingSink {
    fn reply(&self, completed: CompletedAction) {
        info!(
            command = %completed.command,
            seq = completed.seq,
            client = completed.client,
            nodes = completed.node_states.len(),
            "action completed"
        );
    }

    fn is_connected(&self, _client: ClientId) -> bool {
        true
    }
}

// spec §5 / DESIGN.md: one OS thread total, no worker threads — every
// `Device` is its own task, but all of them (and the engine) share this
// single current-thread runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = DaemonConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let Some(path) = &config.config else {
        anyhow::bail!("--config is required (or set PDUD_CONFIG)");
    };
    let raw = std::fs::read_to_string(path)?;
    let spec: ClusterSpec = serde_json::from_str(&raw)?;

    let (cluster, devices) = pdud::build_cluster(
        &spec,
        config.update_interval(),
        config.default_expect_timeout(),
        config.logit,
    )?;

    let (engine, _handle) = Engine::build(cluster, devices, Arc::new(LoggingSink));
    info!(cluster = %spec.name, devices = spec.devices.len(), "engine starting");
    engine.run().await;
    Ok(())
}
