mod escalation;
mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, FromRef},
    http::{Request, StatusCode},
};
use pushbuild_core::config::Config;
use pushbuild_db::{LogStore, SqliteLogStore};
use pushbuild_github::{GitHubIncidentReporter, webhook::DELIVERY_HEADER};
use pushbuild_jobs::{RebuildPipeline, Scheduler};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{
    escalation::{Escalation, Lifecycle, ProcessExit},
    handlers::build_router,
};

// GitHub caps webhook payloads at 25 MB
const MAX_PAYLOAD_SIZE: usize = 25 * 1024 * 1024;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    scheduler: Scheduler,
    store: Arc<dyn LogStore>,
    escalation: Arc<Escalation>,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config_path = std::env::var("PUSHBUILD_CONFIG").unwrap_or_else(|_| "config.yml".into());
    let config: Arc<Config> = {
        let file = BufReader::new(File::open(&config_path).expect("Failed to open config file"));
        serde_yaml::from_reader(file).expect("Failed to parse config file")
    };
    let store = SqliteLogStore::new(&config.log).await.expect("Failed to open log store");
    let reporter = GitHubIncidentReporter::new(&config.incident)
        .expect("Failed to create incident reporter");
    let escalation = Arc::new(Escalation::new(
        Arc::new(store.clone()),
        Arc::new(reporter),
        Arc::new(ProcessExit),
    ));
    let scheduler = Scheduler::new(Arc::new(RebuildPipeline::new(&config.pipeline)));
    tracing::info!(
        "Rebuilding on pushes to {} ({} pipeline steps)",
        config.webhook.target_ref(),
        config.pipeline.steps.len()
    );

    let state = AppState {
        config: config.clone(),
        scheduler,
        store: Arc::new(store.clone()),
        escalation: escalation.clone(),
    };
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    tracing::info!("Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");

    let shutdown = {
        let escalation = escalation.clone();
        async move {
            tokio::select! {
                _ = escalation.draining() => tracing::info!("Escalation started, draining"),
                _ = shutdown_signal() => tracing::info!("Received shutdown signal"),
            }
        }
    };
    if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
        tracing::error!("Web server error: {e}");
    }
    tracing::info!("Web server stopped");

    if escalation.lifecycle() != Lifecycle::Serving {
        // The escalation exits the process once the incident is reported
        std::future::pending::<()>().await;
    }
    store.close().await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_span)
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_SIZE));
    build_router().with_state(state).layer(middleware)
}

fn make_span(request: &Request<Body>) -> Span {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "[unknown]".to_string());
    let delivery = request
        .headers()
        .get(DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("[none]");
    tracing::info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        ip = %ip,
        delivery = %delivery,
    )
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
