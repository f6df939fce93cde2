//! Demo runner: boots a kernel from a TOML config, drives the configured
//! agents with a deterministic scripted provider, and checkpoints on
//! shutdown. Swap in a real `LlmProvider` to run a live ecology.

use std::sync::Arc;

use anyhow::{Context, Result};

use oikos_kernel::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "oikos.toml".to_string());
    let config = Config::from_toml_file(std::path::Path::new(&config_path))
        .with_context(|| format!("loading {}", config_path))?;

    let clock = Arc::new(SystemClock);
    // Resume from the newest checkpoint when one exists; otherwise
    // bootstrap a fresh ecology.
    let kernel = match Kernel::restore_latest(config.clone(), clock.clone()) {
        Ok(kernel) => {
            tracing::info!(
                event_number = kernel.journal().last_number(),
                "restored from checkpoint"
            );
            kernel
        }
        Err(oikos_kernel::error::KernelError::NotFound(_)) => {
            Kernel::with_journal_file(config.clone(), clock).context("bootstrap")?
        }
        Err(e) => return Err(e).context("restore"),
    };
    tracing::info!(
        artifacts = kernel.store().len(),
        agents = config.agents.len(),
        "kernel ready"
    );
    let shared: SharedKernel = Arc::new(tokio::sync::Mutex::new(kernel));

    let provider = Arc::new(demo_provider(&config));
    let mut manager = LoopManager::new(Arc::clone(&shared));
    manager.spawn_mint_timer();
    manager
        .spawn_agents(provider)
        .await
        .context("spawning agent loops")?;

    tracing::info!("running; ctrl-c to checkpoint and exit");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    manager.shutdown().await.context("shutdown checkpoint")?;
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    // Route `log` macros from the kernel into tracing.
    let _ = tracing_log::LogTracer::init();
}

/// A canned proposal script per agent: inspect the world, publish an
/// artifact, check the mint. Enough to watch events flow end to end.
fn demo_provider(config: &Config) -> ScriptedProvider {
    let mut completions = Vec::new();
    for agent in config.agents.keys() {
        completions.push(ScriptedProvider::action(
            format!(
                r#"{{"action_type":"query_kernel","principal_id":"{agent}","query":"balance"}}"#
            ),
            0.0005,
        ));
        completions.push(ScriptedProvider::action(
            format!(
                r#"{{"action_type":"write","principal_id":"{agent}","artifact_id":"note:{agent}","type":"memory","content":"hello from {agent}"}}"#
            ),
            0.0005,
        ));
        completions.push(ScriptedProvider::action(
            format!(
                r#"{{"action_type":"invoke","principal_id":"{agent}","artifact_id":"genesis_mint","method":"status"}}"#
            ),
            0.0005,
        ));
    }
    ScriptedProvider::new(completions)
}
