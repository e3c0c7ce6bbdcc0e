use connect_common::{Config, Mode};
use connect_load::engine::client::{ClientHarness, ClientSettings};
use connect_load::engine::server::Server;
use connect_load::fault::FailFast;
use connect_load::metrics::{self, MetricSources};
use connect_load::stats::{self, ClientStats, ServerStats};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, StatusCode,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_production_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .init();

    info!("Production structured logging initialized (JSON)");
}

async fn metrics_handler(
    req: Request<Body>,
    sources: MetricSources,
) -> Result<Response<Body>, Infallible> {
    match req.uri().path() {
        "/health" => Ok(Response::new(Body::from("OK"))),
        "/metrics" => Ok(Response::new(Body::from(metrics::render_metrics(&sources)))),
        _ => {
            let mut not_found = Response::new(Body::from("Not Found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

async fn run_metrics_server(port: u16, sources: MetricSources) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics::register_metrics();

    let make_svc = make_service_fn(move |_conn| {
        let sources = sources.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| metrics_handler(req, sources.clone())))
        }
    });

    let server = hyper::Server::bind(&addr).serve(make_svc);

    info!(port = port, "Observability server online");

    if let Err(e) = server.await {
        error!(error = %e, "Observability server failed");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_production_logging();
    info!(pid = std::process::id(), "Connection limit test starting");

    let config = Config::load_from_env()?;
    let master_token = CancellationToken::new();
    let fail_fast = FailFast::exit_process();
    let mut sources = MetricSources::default();

    let server = if matches!(config.mode, Mode::Server | Mode::Both) {
        let stats = Arc::new(ServerStats::default());
        let handle = Server::bind(&config.server)?.start(
            Arc::clone(&stats),
            fail_fast.clone(),
            master_token.child_token(),
        )?;

        tokio::spawn(stats::report_server(
            Arc::clone(&stats),
            Duration::from_secs(config.report.server_interval_secs),
            master_token.child_token(),
        ));
        sources.server = Some(stats);
        Some(handle)
    } else {
        None
    };

    if matches!(config.mode, Mode::Client | Mode::Both) {
        let mut client_config = config.client.clone();
        if let Some(server) = &server {
            // Both sides in one process: aim the client at our own listener.
            client_config.target_host = "127.0.0.1".to_string();
            client_config.port = server.local_addr().port();
        }

        let settings = ClientSettings::resolve(&client_config).await?;
        let stats = Arc::new(ClientStats::default());
        let harness = ClientHarness::new(
            settings,
            Arc::clone(&stats),
            fail_fast.clone(),
            master_token.child_token(),
        );

        tokio::spawn(stats::report_client(
            Arc::clone(&stats),
            client_config.connection_limit,
            Duration::from_secs(config.report.client_interval_secs),
            master_token.child_token(),
        ));
        harness.start();
        sources.client = Some((stats, client_config.connection_limit as u64));
    }

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            run_metrics_server(port, sources).await;
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    master_token.cancel();
    if let Some(server) = server {
        server.shutdown();
    }
    Ok(())
}
