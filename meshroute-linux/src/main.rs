// meshroute node for Linux: UDP radio emulation, tokio timers, route commands on stdin.

mod config;
mod node;
mod radio;

use std::path::PathBuf;

use anyhow::{bail, Context};
use meshroute_core::RouteEngine;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("meshroute-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument: {}", other),
        }
    }

    let cfg = config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid log_level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let address = cfg.node_address()?;
    let target = cfg.target_address()?;
    let in_range = cfg.neighbor_addresses()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let radio = radio::Radio::open(address, cfg.group, cfg.port, in_range)
            .await
            .with_context(|| format!("opening radio on {}:{}", cfg.group, cfg.port))?;
        let engine = RouteEngine::with_config(address, cfg.routing.clone());
        let node = node::Node::new(engine, radio, target, cfg.rebroadcast_jitter());
        node.run(shutdown_signal()).await
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
