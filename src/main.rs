// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use arbor_core::{AgentEventKind, Runtime};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = arbor_config::load(cli.config.as_deref())?;
    let runtime = Runtime::from_config(&config).context("building runtime")?;

    match cli.command {
        Commands::Submit { task, session_id, owner } => {
            let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            // Subscribe before the loop spawns so no event is missed.
            let rx = runtime.subscribe(&id);
            let session = runtime.submit(&task, Some(id), owner).await?;
            eprintln!("session {}", session.id);
            stream_events(rx).await
        }
        Commands::Show { session_id } => {
            let session = runtime.get(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            Ok(())
        }
        Commands::Resume { session_id, message } => {
            let rx = runtime.subscribe(&session_id);
            runtime.continue_session(&session_id, &message).await?;
            stream_events(rx).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print events as JSON lines until the session reaches a terminal status.
async fn stream_events(
    mut rx: tokio::sync::broadcast::Receiver<arbor_core::AgentEvent>,
) -> anyhow::Result<()> {
    loop {
        let event = rx.recv().await.context("event stream closed")?;
        println!("{}", serde_json::to_string(&event)?);
        if event.kind == AgentEventKind::StatusChange
            && matches!(event.content.as_deref(), Some("COMPLETED") | Some("FAILED"))
        {
            return Ok(());
        }
    }
}
