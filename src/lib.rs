pub mod api;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::AppConfig;
use crate::services::download::DownloadGateway;
use crate::services::pipeline::Pipeline;
use crate::services::stager::FileStager;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::convert::Infallible;
use std::sync::Arc;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::process::process_documents,
        api::handlers::download::download_file,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::process::ProcessForm,
            models::ProcessResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "system", description = "Service status"),
        (name = "processing", description = "Invoice reconciliation and result download")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub stager: Arc<FileStager>,
    pub pipeline: Arc<Pipeline>,
    pub downloads: Arc<DownloadGateway>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Pipeline) -> Self {
        Self {
            stager: Arc::new(FileStager::new(config.upload_dir.clone())),
            downloads: Arc::new(DownloadGateway::new(config.upload_dir.clone())),
            pipeline: Arc::new(pipeline),
            config: Arc::new(config),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let timeout = state.config.request_timeout();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/process",
            post(api::handlers::process::process_documents)
                .layer::<_, Infallible>(DefaultBodyLimit::max(state.config.max_upload_bytes))
                .layer::<_, Infallible>(GlobalConcurrencyLimitLayer::new(
                    state.config.max_concurrent_requests(),
                ))
                .layer::<_, Infallible>(TimeoutLayer::new(timeout)),
        )
        .route(
            "/download/:filename",
            get(api::handlers::download::download_file).layer(TimeoutLayer::new(timeout)),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
