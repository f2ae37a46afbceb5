//! # sockroute
//!
//! Bridge server binary: loads settings, installs logging and metrics,
//! registers the demo routes and serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use sockroute_core::HandlerError;
use sockroute_server::http::Method;
use sockroute_server::{BridgeServer, RouteTable, handler_fn, load_config};
use sockroute_telemetry::{LogFormat, TelemetryConfig, init_telemetry};
use tracing::{Level, info, warn};

/// WebSocket to route-handler bridge server.
#[derive(Parser, Debug)]
#[command(name = "sockroute", about = "WebSocket to route-handler bridge server")]
struct Cli {
    /// JSON settings file, merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

/// Routes served by the binary.
fn demo_routes() -> RouteTable {
    let mut routes = RouteTable::new();
    let _ = routes
        .route(
            Method::GET,
            "/ws",
            handler_fn(|ctx, reply| {
                let body: Value = ctx.json()?;
                match body["op"].as_str() {
                    Some("ping") => reply.json(&json!({"pong": true})),
                    Some("echo") => reply.json(&body["data"]),
                    Some("count") => {
                        let seen = ctx.get("seen").and_then(Value::as_u64).unwrap_or(0) + 1;
                        let _ = ctx.set("seen", json!(seen));
                        reply.json(&json!({"seen": seen}));
                    }
                    Some(op) => return Err(HandlerError::coded(404, format!("unknown op: {op}"))),
                    None => return Err(HandlerError::coded(400, "missing op")),
                }
                Ok(())
            }),
        )
        .route(
            Method::GET,
            "/divide",
            handler_fn(|ctx, reply| {
                let body: Value = ctx.json()?;
                let (Some(a), Some(b)) = (body["a"].as_i64(), body["b"].as_i64()) else {
                    return Err(HandlerError::coded(400, "a and b must be integers"));
                };
                let quotient = a.checked_div(b).ok_or_else(|| HandlerError::msg("div by zero"))?;
                reply.json(&json!({"result": quotient}));
                Ok(())
            }),
        );
    routes
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        log_level: Level::INFO,
        module_levels: vec![("sockroute_server".into(), Level::DEBUG)],
        format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
    };
    init_telemetry(&telemetry).context("failed to initialise logging")?;

    let mut config = load_config(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    let shutdown_timeout = config.shutdown_timeout();

    let mut server = BridgeServer::new(config, demo_routes());
    match sockroute_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(error) => warn!(%error, "metrics disabled"),
    }

    let handle = server.listen().await.context("failed to bind")?;
    info!(addr = %handle.addr(), "sockroute ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    let closed = server
        .shutdown()
        .graceful_shutdown(handle.into_handles(), Some(shutdown_timeout))
        .await;
    info!(closed, "shutdown complete");
    Ok(())
}
