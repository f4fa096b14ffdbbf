use crate::{config::ServerConfig, orchestrator::Orchestrator, routes::api_routes, telemetry::Metrics};
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::trace::TraceLayer;

// Room for multipart framing and the prompt field on top of the image itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct SharedState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<Metrics>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        orchestrator: Arc<Orchestrator>,
        metrics: Arc<Metrics>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let addr = config.get_address();

        let app_state = SharedState {
            orchestrator,
            metrics,
        };

        let router = Router::new()
            .merge(api_routes())
            .with_state(app_state)
            .layer(DefaultBodyLimit::max(
                config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES,
            ))
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self, mut shutdown_rx: Receiver<()>) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        Ok(server_handle)
    }
}
