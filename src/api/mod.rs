mod handlers;

pub use handlers::{ErrorBody, USER_HEADER};

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::service::ChangeService;

pub fn create_router(service: Arc<ChangeService>) -> Router {
    create_router_with_config(service, &ServerConfig::default())
}

pub fn create_router_with_config(service: Arc<ChangeService>, config: &ServerConfig) -> Router {
    let api = Router::new()
        // Changes
        .route("/changes", post(handlers::submit_change))
        .route("/changes/{sequence}/undo", post(handlers::undo_change))
        // Read operations
        .route("/operations", post(handlers::run_operation))
        .route("/assemblies", get(handlers::list_assemblies))
        .route("/assemblies/{id}/refseqs", get(handlers::list_ref_seqs))
        .route("/assemblies/{id}/changes", get(handlers::list_changes))
        .route("/assemblies/{id}/search", get(handlers::search_features))
        .route("/refseqs/{id}/features", get(handlers::list_ref_seq_features))
        .route("/refseqs/{id}/sequence", get(handlers::get_sequence))
        .route("/features/{id}", get(handlers::get_feature))
        // Health
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(config)),
        )
        .with_state(service)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    match &config.cors_origins {
        None => CorsLayer::permissive(),
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}
