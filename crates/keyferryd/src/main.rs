#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use keyferryd::capabilities::{
    Capabilities, ClipboardSetter, CommandClipboard, CommandFocusInspector, CommandInjector,
    CommandSpec, FallbackInjector, FocusInspector, Injector,
};
use keyferryd::clock::SystemClock;
use keyferryd::config::{AgentConfig, Args};
use keyferryd::metrics::start_metrics_server;
use keyferryd::registry::{DeviceRegistry, SealedDeviceStore};
use keyferryd::store::{MemoryStore, PlainFileStore, SealedFileStore};
use keyferryd::{run_with_shutdown, AgentState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SEALED_STORE_FILE: &str = "devices.sealed";
const MACHINE_KEY_FILE: &str = "machine.key";
const PLAIN_STORE_FILE: &str = "devices.json";

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn data_dir(args: &Args) -> Result<PathBuf> {
    if let Some(ref dir) = args.data_dir {
        return Ok(dir.clone());
    }
    dirs::data_dir()
        .map(|d| d.join("keyferry"))
        .ok_or_else(|| anyhow::anyhow!("no data directory available; pass --data-dir"))
}

fn open_store(args: &Args) -> Result<Arc<dyn SealedDeviceStore>> {
    if args.ephemeral {
        warn!("ephemeral mode: paired devices are forgotten on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let dir = data_dir(args)?;
    if args.allow_insecure_store {
        return Ok(Arc::new(PlainFileStore::new(dir.join(PLAIN_STORE_FILE))));
    }
    info!(dir = %dir.display(), "using sealed device store");
    Ok(Arc::new(SealedFileStore::new(
        dir.join(SEALED_STORE_FILE),
        dir.join(MACHINE_KEY_FILE),
    )))
}

fn command(line: &str, flag: &str) -> Result<CommandSpec> {
    CommandSpec::parse(line).ok_or_else(|| anyhow::anyhow!("{flag} must not be empty"))
}

fn build_capabilities(args: &Args, deadline: Duration) -> Result<Capabilities> {
    let helper = |line: &str, flag: &str| command(line, flag).map(|c| c.with_deadline(deadline));
    let mut chain: Vec<Box<dyn Injector>> = Vec::new();
    for line in &args.inject_cmds {
        chain.push(Box::new(CommandInjector::new(helper(line, "--inject-cmd")?)));
    }
    if chain.is_empty() {
        anyhow::bail!("at least one --inject-cmd is required");
    }

    let clipboard = args
        .clipboard_cmd
        .as_deref()
        .map(|line| helper(line, "--clipboard-cmd"))
        .transpose()?
        .map(|spec| Arc::new(CommandClipboard::new(spec)) as Arc<dyn ClipboardSetter>);
    let focus = args
        .focus_cmd
        .as_deref()
        .map(|line| helper(line, "--focus-cmd"))
        .transpose()?
        .map(|spec| Arc::new(CommandFocusInspector::new(spec)) as Arc<dyn FocusInspector>);

    Ok(Capabilities {
        injector: Arc::new(FallbackInjector::new(chain)),
        clipboard,
        focus,
    })
}

fn pairing_uri(host: &str, port: u16, token: &str, token_id: &str) -> String {
    format!("keyferry://pair?host={host}&port={port}&token={token}&id={token_id}")
}

fn advertised_host(args: &Args, bound: SocketAddr) -> String {
    if let Some(ref host) = args.advertise_host {
        return host.clone();
    }
    if bound.ip().is_unspecified() {
        warn!("listening on an unspecified address; pass --advertise-host for a reachable pairing URI");
    }
    bound.ip().to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config: AgentConfig = args.clone().into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    if config.clipboard_on_block && args.clipboard_cmd.is_none() {
        anyhow::bail!("configuration error: clipboard_on_block requires --clipboard-cmd");
    }
    if (!config.allow_targets.is_empty() || !config.deny_targets.is_empty())
        && args.focus_cmd.is_none()
    {
        warn!("target policy configured without --focus-cmd; every injection will be denied");
    }

    let capabilities = build_capabilities(&args, config.inject_timeout)?;
    let store = open_store(&args)?;
    let registry = tokio::task::spawn_blocking(move || DeviceRegistry::load(store)).await??;

    let listener = TcpListener::bind(config.listen).await?;
    let bound = listener.local_addr()?;
    info!("bound to {}", bound);

    let metrics_addr = config.metrics_addr;
    let state = Arc::new(AgentState::new(
        config,
        Arc::new(registry),
        capabilities,
        Arc::new(SystemClock),
    ));

    if let Some(addr) = metrics_addr {
        let health = state.health.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr, health).await {
                warn!("metrics server error: {}", e);
            }
        });
    }

    if let Some(issued) = state.pairing_mode(args.pair) {
        let host = advertised_host(&args, bound);
        println!(
            "{}",
            pairing_uri(&host, bound.port(), &issued.token, &issued.token_id)
        );
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(());
    if let Err(e) = server.await? {
        tracing::error!("agent error: {}", e);
    }

    Ok(())
}
