//! Scaleplane
//!
//! Runs the control plane on the simulated backends and serves health,
//! metrics and the monitoring dashboard over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scaleplane::{ControlPlane, ControlPlaneConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Scalability control plane for data-backed services
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(long, short, env = "SCALEPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of simulated instances registered at startup
    #[arg(long, env = "SCALEPLANE_INSTANCES")]
    instances: Option<u32>,

    /// Disable the autoscaling loop
    #[arg(long, env = "SCALEPLANE_NO_AUTOSCALE")]
    no_autoscale: bool,

    /// Metrics and dashboard server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };
    if let Some(instances) = args.instances {
        config.simulation.initial_instances = instances;
    }
    if args.no_autoscale {
        config.autoscale.enabled = false;
    }

    info!("Starting scaleplane");
    info!("  Pools: {}", config.pools.len());
    info!("  Cache layers: {}", config.cache.layers.len());
    info!(
        "  Autoscale: {} ({}..={} instances)",
        config.autoscale.enabled, config.autoscale.min_instances, config.autoscale.max_instances
    );
    info!("  Archive policies: {}", config.archive.policies.len());

    let plane = Arc::new(ControlPlane::simulated(config).context("building control plane")?);
    plane.start().await.context("starting control plane")?;

    let health_addr: SocketAddr = args.health_addr.parse().context("invalid health address")?;
    let metrics_addr: SocketAddr = args.metrics_addr.parse().context("invalid metrics address")?;

    let health_plane = plane.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(health_addr, health_plane, Route::Health).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_plane = plane.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(metrics_addr, metrics_plane, Route::Metrics).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    plane.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("h2=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// HTTP Servers
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Route {
    /// `/healthz`, `/livez`, `/readyz`
    Health,
    /// `/metrics`, `/dashboard`, `/alerts`
    Metrics,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("serialization failed: {e}"),
        ),
    }
}

fn handle(plane: &ControlPlane, route: Route, path: &str) -> Response<Full<Bytes>> {
    match (route, path) {
        (Route::Health, "/healthz" | "/livez") => {
            let report = plane.health();
            let status = if report.live {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            respond(status, "text/plain", if report.live { "ok" } else { "stopping" })
        }
        (Route::Health, "/readyz") => {
            let report = plane.health();
            let status = if report.ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &report)
        }
        (Route::Metrics, "/metrics") => match plane.metrics_text() {
            Ok(text) => respond(StatusCode::OK, plane.metrics_content_type(), text),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        (Route::Metrics, "/dashboard") => json(StatusCode::OK, &plane.dashboard()),
        (Route::Metrics, "/alerts") => json(StatusCode::OK, &plane.monitor().alerts(false)),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

async fn serve(addr: SocketAddr, plane: Arc<ControlPlane>, route: Route) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {route:?} server to {addr}"))?;
    info!("{:?} server listening on {}", route, addr);

    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        let io = TokioIo::new(stream);
        let plane = plane.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = handle(&plane, route, req.uri().path());
                async move { Ok::<_, std::convert::Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("{:?} server connection error: {}", route, e);
            }
        });
    }
}
