//! Tandem node runner.
//!
//! Runs one side of a live/backup pair and prints node events as JSON lines.
//! Exits non-zero if the live lease is lost.

use std::process::ExitCode;
use std::sync::Arc;

use tandem_core::observability::{LogFormat, init_logging};
use tandem_core::{Error, NodeManagerConfig, Result};
use tandem_node::{NodeEvent, NodeManager};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Live,
    Backup,
}

fn role_from_env() -> Result<Role> {
    match std::env::var("TANDEM_ROLE") {
        Err(_) => Ok(Role::Live),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" | "live" => Ok(Role::Live),
            "backup" => Ok(Role::Backup),
            other => Err(Error::configuration(format!(
                "TANDEM_ROLE must be live or backup (got {other})"
            ))),
        },
    }
}

fn log_format_from_env() -> LogFormat {
    std::env::var("TANDEM_LOG_FORMAT")
        .ok()
        .and_then(|value| LogFormat::parse(&value))
        .unwrap_or_default()
}

fn print_event(event: &NodeEvent) -> Result<()> {
    let line = serde_json::to_string(event)
        .map_err(|e| Error::internal_with_source("failed to encode node event", e))?;
    println!("{line}");
    Ok(())
}

async fn run() -> Result<ExitCode> {
    let config = NodeManagerConfig::from_env()?;
    let role = role_from_env()?;
    let node = Arc::new(NodeManager::from_config(config, Handle::current())?);
    let mut events = node.subscribe();
    tracing::info!(
        node_id = node.node_id(),
        role = ?role,
        backend = node.config().backend.as_label(),
        lease_duration = ?node.config().lease_duration,
        "tandem node starting"
    );

    let signal_node = Arc::clone(&node);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            signal_node.stop().await;
        }
    });

    match role {
        Role::Live => match node.start_live_node().await {
            Ok(_) | Err(Error::Stopped) => {}
            Err(err) => {
                node.stop().await;
                return Err(err);
            }
        },
        Role::Backup => node.start_backup().await?,
    }

    let exit = loop {
        match events.recv().await {
            Ok(event) => {
                print_event(&event)?;
                match event {
                    NodeEvent::LeaseLost { .. } => break ExitCode::FAILURE,
                    NodeEvent::Stopped { .. } => break ExitCode::SUCCESS,
                    _ => {}
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event consumer fell behind");
            }
            Err(RecvError::Closed) => break ExitCode::SUCCESS,
        }
    };

    node.stop().await;
    interrupt.abort();
    Ok(exit)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging(log_format_from_env());
    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(code = err.code(), error = %err, "tandem-node failed");
            ExitCode::FAILURE
        }
    }
}
