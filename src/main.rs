use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;

use odoo_mcp_gateway::config::{GatewayConfig, TransportKind};
use odoo_mcp_gateway::mcp::Dispatcher;
use odoo_mcp_gateway::transport::{http, stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportMode {
    Stdio,
    Http,
    StreamableHttp,
    Sse,
}

impl From<TransportMode> for TransportKind {
    fn from(mode: TransportMode) -> Self {
        match mode {
            TransportMode::Stdio => TransportKind::Stdio,
            TransportMode::Http => TransportKind::Http,
            TransportMode::StreamableHttp => TransportKind::StreamableHttp,
            TransportMode::Sse => TransportKind::Sse,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "odoo-mcp-gateway", version, about = "MCP gateway for Odoo backends")]
struct Cli {
    /// Path to a JSON config file; environment variables override it.
    #[arg(long, env = "GATEWAY_CONFIG_JSON")]
    config: Option<PathBuf>,

    /// Transport override (stdio for desktop clients, http/sse for servers).
    #[arg(long, value_enum)]
    transport: Option<TransportMode>,

    /// Listen address for the HTTP transports.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(mode) = cli.transport {
        config.connection_type = mode.into();
    }
    if config.connection_type == TransportKind::StreamableHttp {
        config.http.streamable = true;
    }

    // stdio reserves stdout for JSON-RPC, so logs must go to stderr with
    // colors off; the HTTP transports log normally.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    match config.connection_type {
        TransportKind::Stdio => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(config.clone()))?);
    let _background = dispatcher.start_background();

    info!(
        odoo_url = %config.odoo_url,
        database = %config.database,
        protocol = ?config.protocol,
        transport = ?config.connection_type,
        "gateway starting"
    );

    match config.connection_type {
        TransportKind::Stdio => stdio::run(dispatcher).await?,
        TransportKind::Http | TransportKind::StreamableHttp | TransportKind::Sse => {
            let listen = cli
                .listen
                .unwrap_or_else(|| format!("{}:{}", config.http.host, config.http.port));
            http::serve(dispatcher, &listen).await?;
        }
    }

    Ok(())
}
