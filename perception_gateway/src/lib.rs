mod routes;
mod server;

pub mod annotate;
pub mod app;
pub mod caption;
pub mod config;
pub mod correlation;
pub mod detection;
pub mod exclusive;
pub mod image_codec;
pub mod orchestrator;
pub mod sink;
pub mod telemetry;
pub mod worker_pool;

#[cfg(test)]
mod test_support;

pub use app::start_app;
