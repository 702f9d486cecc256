//! hybrid-bridge daemon: serves the MCP endpoint locally and publishes it
//! through a dev tunnel until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hb_bridge::ServiceManager;
use hb_core::config::Config;
use hb_core::state::StateSnapshot;
use hb_daemon::patient_tool::PatientBackgroundTool;
use hb_harness::mcp::ToolRegistry;
use hb_harness::provider::LocalModelClient;
use hb_telemetry::logging::{self, LogFormat};
use tracing::{debug, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Local MCP server exposing patient background summaries over a dev tunnel.
#[derive(Parser)]
#[command(name = "hybrid-bridge", version, about)]
struct Cli {
    /// Port to listen on (overrides config and HB_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Serve locally without starting the tunnel.
    #[arg(long)]
    no_tunnel: bool,

    /// Config file (default: ~/.hybrid-bridge/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("invalid environment override")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::from_config(&config.general.log_format)
    };
    logging::init("hybrid-bridge", &config.general.log_level, format);

    // The blocking HTTP client must be created outside any tokio runtime.
    let backend = Arc::new(LocalModelClient::from_config(&config.model).context("failed to build model client")?);
    info!(url = backend.chat_url(), model = %config.model.model_id, "local model endpoint");

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(PatientBackgroundTool::new(
        config.data.dir.clone(),
        config.model.clone(),
        backend,
    )));

    let with_tunnel = config.tunnel.enabled && !cli.no_tunnel;
    let manager = ServiceManager::new(config, registry);
    manager.state().set_observer(Arc::new(|s: &StateSnapshot| {
        debug!(
            service = %s.service_status,
            tunnel = %s.tunnel_status,
            tunnel_url = %s.tunnel_url,
            logs = s.request_logs.len(),
            "state changed"
        );
    }));

    if !manager.start(with_tunnel) {
        let snapshot = manager.state().snapshot();
        bail!("service failed to start: {}", snapshot.service_error);
    }

    let snapshot = manager.state().snapshot();
    info!(local_url = %snapshot.local_url, "MCP endpoint ready");
    if !snapshot.tunnel_url.is_empty() {
        info!(tunnel_url = %snapshot.tunnel_url, "public endpoint ready");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    manager.stop();
    Ok(())
}
