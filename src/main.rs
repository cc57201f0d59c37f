use clap::Parser;
use dotenvy::dotenv;
use invoice_reconciler::api::middleware::request_id::request_id_middleware;
use invoice_reconciler::config::AppConfig;
use invoice_reconciler::infrastructure::{pipeline, storage};
use invoice_reconciler::services::retention::RetentionWorker;
use invoice_reconciler::{AppState, create_app};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the API server (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for staged uploads and results (overrides UPLOAD_FOLDER)
    #[arg(short, long)]
    upload_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "invoice_reconciler=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AppConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.upload_dir {
        config.upload_dir = dir;
    }

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?
        .block_on(serve(config))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    info!("🚀 Starting Invoice Reconciler...");
    info!(
        "🛡️  Limits: Max Size={}MB, Workers={}, In-flight={}, Timeout={}s",
        config.max_upload_bytes / 1024 / 1024,
        config.workers,
        config.max_concurrent_requests(),
        config.request_timeout_secs
    );

    storage::setup_upload_dir(&config.upload_dir).await?;
    let pipeline = pipeline::setup_pipeline(&config)?;

    // Setup Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut worker_handle = None;
    if let Some(max_age) = config.output_retention() {
        let worker = RetentionWorker::new(
            config.upload_dir.clone(),
            max_age,
            Duration::from_secs(config.retention_sweep_interval_secs),
            shutdown_rx,
        );
        worker_handle = Some(tokio::spawn(worker.run()));
    } else {
        info!("Output retention disabled; results are kept until removed externally");
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = create_app(AppState::new(config, pipeline))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                })
                .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                    info!("📥 {} {}", request.method(), request.uri());
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: Duration,
                     _span: &tracing::Span| {
                        info!(
                            "📤 Finished in {:?} with status {}",
                            latency,
                            response.status()
                        );
                    },
                ),
        )
        .layer(axum::middleware::from_fn(request_id_middleware));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            error!("Retention worker ended abnormally: {}", e);
        }
    }

    info!("👋 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
