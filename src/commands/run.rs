use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::api::ListParams;
use kube::{Api, Client};
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use store_operator::cluster::ClusterClient;
use store_operator::config::OperatorConfig;
use store_operator::crd::Store;
use store_operator::events::EventPublisher;
use store_operator::helm::Helm;
use store_operator::metrics;
use store_operator::reconciler::Context;
use store_operator::worker::{self, WorkerPool};

/* ============================= STATE ============================= */

pub(crate) struct RunState {
    pub(crate) ready: bool,
}

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("Starting Store operator...\n");

    let config = OperatorConfig::from_env();

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    // Verify actual cluster connectivity before starting the loops
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // The watch cannot start without the CRD installed
    print!("  Store CRD ................... ");
    let stores: Api<Store> = Api::all(client.clone());
    match stores.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!(
                "Store CRD is not queryable: {}. Install it with: store-operator crd install",
                e
            );
        }
    }

    print!("  Event publisher ............. ");
    let publisher = EventPublisher::connect(config.redis_url.as_deref()).await;
    if publisher.is_enabled() {
        println!("OK (redis)");
    } else {
        println!("disabled");
    }

    let ctx = Arc::new(Context {
        cluster: ClusterClient::new(client.clone()),
        helm: Helm::new(client, &config),
        publisher,
        config: config.clone(),
    });

    metrics::force_init();
    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  CRD watch ................... Store.platform.urumi.ai/v1");
    println!(
        "  Max parallel provisions ..... {}",
        config.max_parallel_provisions
    );
    println!("  Domain suffix ............... {}", config.domain_suffix);
    println!("  Helm chart .................. {}", config.helm_chart_path);
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until loops start, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!(
        max_parallel = config.max_parallel_provisions,
        domain = %config.domain_suffix,
        "operator_started"
    );

    let run_state = Arc::new(Mutex::new(RunState { ready: false }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = run_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let (pool, rx) = WorkerPool::new(ctx);
    let workers = tokio::spawn(pool.clone().run(rx));
    let timer = tokio::spawn(worker::drift_timer(pool.clone()));
    let watcher = tokio::spawn(worker::watch_stores(pool));

    // Ready once the watch and worker loops are running.
    run_state.lock().await.ready = true;

    // Ctrl+C drops (cancels) the watch stream; in-flight handlers finish
    // their current step before the process exits.
    tokio::select! {
        result = watcher => {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "watch_stream_error");
            }
            info!("watch_stream_ended");
            println!("\nWatch stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    workers.abort();
    timer.abort();

    // Signal the HTTP server to shut down
    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_run_router(state: Arc<Mutex<RunState>>) -> Router {
    Router::new()
        .route("/metrics", get(run_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || run_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<Mutex<RunState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_run_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server on :9090")?;

    info!(addr = %addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn run_ready_handler(state: Arc<Mutex<RunState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn run_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_run_state(ready: bool) -> Arc<Mutex<RunState>> {
        Arc::new(Mutex::new(RunState { ready }))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_when_ready() {
        let app = build_run_router(test_run_state(true));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"READY");
    }

    #[tokio::test]
    async fn test_readyz_when_not_ready() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"NOT READY");
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
