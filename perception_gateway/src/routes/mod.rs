mod health;
mod metrics;
mod upload_image;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub use health::healthcheck;
pub use metrics::metrics_handler;
pub use upload_image::upload_image;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .route("/upload-image", post(upload_image))
        .route("/upload-image/", post(upload_image))
}
