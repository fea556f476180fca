use std::{io, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mcp_server::{McpServer, ToolRegistry};
use mcp_tools::{default_tools_with_options, GhCliGateway, ToolOptions};
use mirrorkit_engine::CoreConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mirrorkit-mcp-server", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Explicit path to the configuration file (mirrorkit.toml)
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Log filter (e.g. info, debug, mirrorkit_tools=debug); overrides RUST_LOG
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the mirror store root
    #[arg(long = "store-root", value_name = "PATH")]
    store_root: Option<PathBuf>,

    /// Executable used for pull-request operations
    #[arg(long = "gh-program", value_name = "PATH", default_value = "gh")]
    gh_program: String,

    /// Validate the configuration, print it and exit
    #[arg(long = "check-config")]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let mut config =
        CoreConfig::load(args.config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = args.store_root {
        config.store.root = root;
    }
    if let Err(problems) = config.validate() {
        for problem in &problems {
            tracing::error!("config: {}", problem);
        }
        return Err(anyhow!("invalid configuration ({} problem(s))", problems.len()));
    }

    if args.check_config {
        println!("{}", render_config(&config)?);
        return Ok(());
    }

    tracing::info!(
        store = %config.store.resolved_root().display(),
        version = env!("CARGO_PKG_VERSION"),
        "mirrorkit-mcp-server starting"
    );

    let options = ToolOptions {
        gateway: Some(Arc::new(GhCliGateway::new(args.gh_program))),
    };
    let tools = default_tools_with_options(config, options).context("Failed to initialize tools")?;

    let server = McpServer::new(ToolRegistry::new(tools));
    server.serve_stdio().await
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // stdout carries JSON-RPC
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(io::stderr)
        .try_init();
}

fn render_config(config: &CoreConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration")
}
