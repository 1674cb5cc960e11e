use axum::{
    Router,
    http::HeaderValue,
    routing::{IntoMakeService, get},
};
use deployment::Deployment;
use tower_http::cors::{Any, CorsLayer};

use crate::DeploymentImpl;

pub mod health;
pub mod research;
pub mod research_ws;

/// The full application router, mounted under `/api`.
pub fn app(deployment: DeploymentImpl) -> Router {
    let cors = cors_layer(&deployment);

    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(research::router(&deployment))
        .with_state(deployment);

    Router::new().nest("/api", base_routes).layer(cors)
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    app(deployment).into_make_service()
}

fn cors_layer(deployment: &DeploymentImpl) -> CorsLayer {
    let origins = deployment
        .config()
        .try_read()
        .map(|config| config.server.cors_origins.clone())
        .unwrap_or_default();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}
