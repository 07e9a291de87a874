//! Concourse: session-scoped MCP gateway.
//!
//! Two subcommands:
//! - `concourse serve`: Streamable HTTP MCP server; caller identity per request
//!   from the `x-concourse-roles` / `x-concourse-agent` headers
//! - `concourse stdio`: STDIO transport for desktop MCP clients; identity from
//!   `--roles` / `--agent`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::http::Request;
use axum::response::IntoResponse;
use clap::{Parser, Subcommand};
use nimbus_concourse::{
    Gateway, GatewayConfig, GatewayMcpServer, RmcpConnector, SessionContext, load_config,
    run_config_watch,
};
use rmcp::ServiceExt;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as TowerServiceExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "concourse",
    version,
    about = "Concourse: one MCP endpoint in front of many upstream MCP servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a Streamable HTTP MCP server exposing every upstream capability
    Serve {
        /// Path to concourse.toml [default: ./concourse.toml or ~/.config/concourse/concourse.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
        /// Bind address. Identity headers are trusted as sent, so expose
        /// beyond loopback only behind an authenticating proxy.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Serve every upstream capability over STDIO
    Stdio {
        /// Path to concourse.toml [default: ./concourse.toml or ~/.config/concourse/concourse.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Comma-separated roles for this session
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
        /// Agent name for this session
        #[arg(long)]
        agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the STDIO transport
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down Concourse...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config, port, host } => {
            let config = resolve_config(config)?;
            run_serve(config, host, port, cancel).await?;
        }
        Commands::Stdio {
            config,
            roles,
            agent,
        } => {
            let config = resolve_config(config)?;
            let identity = SessionContext::new(roles, agent.as_deref());
            run_stdio(config, identity, cancel).await?;
        }
    }

    Ok(())
}

/// Load the config, build the gateway and connect every configured server.
async fn start_gateway(config_path: &Path) -> Result<(Arc<Gateway>, GatewayConfig)> {
    let config = load_config(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config file {:?}: {}", config_path, e))?;
    let gateway = Arc::new(Gateway::new(&config, Arc::new(RmcpConnector)));
    gateway.start(&config).await;
    Ok((gateway, config))
}

/// Start a Streamable HTTP MCP server backed by the gateway.
///
/// Spawns the config watcher, then serves via StreamableHttpService + axum.
/// The gateway is shut down after the listener stops.
async fn run_serve(
    config_path: PathBuf,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let (gateway, config) = start_gateway(&config_path).await?;
    let server = GatewayMcpServer::new(Arc::clone(&gateway));

    tokio::spawn(run_config_watch(
        config_path.clone(),
        config,
        Arc::clone(&gateway),
        server.peers_handle(),
        cancel.child_token(),
    ));

    let session_manager = Arc::new(LocalSessionManager::default());
    let http_config = StreamableHttpServerConfig {
        cancellation_token: cancel.clone(),
        ..Default::default()
    };
    let server_for_factory = server.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(server_for_factory.clone()),
        session_manager,
        http_config,
    );

    let app = Router::new().fallback(move |req: Request<axum::body::Body>| {
        let svc = mcp_service.clone();
        async move {
            match svc.oneshot(req).await {
                Ok(response) => response.into_response(),
                Err(never) => match never {},
            }
        }
    });

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, "Concourse HTTP server listening");
    tracing::info!("Connect your MCP client to http://{}:{}/mcp", host, port);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;

    cancel.cancel();
    gateway.shutdown().await;
    served.map_err(|e| anyhow::anyhow!("Concourse HTTP server error: {}", e))?;

    tracing::info!("Concourse HTTP server stopped");
    Ok(())
}

/// Serve the gateway over stdin/stdout using rmcp's serve_with_ct.
async fn run_stdio(
    config_path: PathBuf,
    identity: SessionContext,
    cancel: CancellationToken,
) -> Result<()> {
    let (gateway, config) = start_gateway(&config_path).await?;
    let server = GatewayMcpServer::new(Arc::clone(&gateway)).with_identity(identity);

    tokio::spawn(run_config_watch(
        config_path.clone(),
        config,
        Arc::clone(&gateway),
        server.peers_handle(),
        cancel.child_token(),
    ));

    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = server
        .serve_with_ct(transport, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize Concourse stdio transport: {:?}", e))?;

    tracing::info!("Concourse stdio transport initialized, waiting for messages");

    let outcome = tokio::select! {
        result = running.waiting() => match result {
            Ok(reason) => {
                tracing::info!(?reason, "Concourse stdio transport completed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Concourse stdio transport error");
                Err(anyhow::anyhow!("Concourse stdio transport error: {}", e))
            }
        },
        _ = cancel.cancelled() => {
            tracing::info!("Concourse stdio transport cancelled");
            Ok(())
        }
    };

    cancel.cancel();
    gateway.shutdown().await;
    outcome
}

/// Resolve config file path: explicit flag → ./concourse.toml → ~/.config/concourse/concourse.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("concourse.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("concourse").join("concourse.toml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No concourse.toml found. Searched ./concourse.toml and ~/.config/concourse/concourse.toml. \
         Use --config to specify a path."
    ))
}
