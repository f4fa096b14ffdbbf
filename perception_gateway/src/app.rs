use crate::{
    annotate::Annotator,
    caption::{CaptionModel, OllamaCaptionService},
    config::Config,
    detection::{DetectionModel, GrpcDetectionService},
    exclusive::Exclusive,
    orchestrator::{Collaborators, Orchestrator, OrchestratorSettings},
    server::HttpServer,
    sink::{HttpSink, ResultSink},
    telemetry::Metrics,
    worker_pool::BackgroundPool,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

async fn build_collaborators(config: &Config) -> Result<Collaborators, Box<dyn Error>> {
    let captioner = match OllamaCaptionService::new(&config.caption) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to initialize caption service: {:?}", e);
            return Err(Box::new(e));
        }
    };
    let captioner: Arc<dyn CaptionModel> = if config.caption.serialize_calls {
        Arc::new(Exclusive::new(captioner))
    } else {
        Arc::new(captioner)
    };

    let detector = match GrpcDetectionService::new(&config.detection).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to initialize detection service: {:?}", e);
            return Err(Box::new(e));
        }
    };
    let detector: Arc<dyn DetectionModel> = if config.detection.serialize_calls {
        Arc::new(Exclusive::new(detector))
    } else {
        Arc::new(detector)
    };

    let sink: Arc<dyn ResultSink> = Arc::new(HttpSink::new(&config.sink)?);

    Ok(Collaborators {
        captioner,
        detector,
        sink,
    })
}

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new()?);
    let collaborators = build_collaborators(&config).await?;
    let annotator = Arc::new(Annotator::new(&config.annotation)?);
    let pool = BackgroundPool::new(&config.workers, metrics.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        collaborators,
        annotator,
        pool.clone(),
        OrchestratorSettings::from(&config),
        metrics.clone(),
    ));

    let server = HttpServer::new(orchestrator, metrics, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("HTTP server stopped with an error: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    if pool.shutdown(config.workers.get_shutdown_grace()).await {
        tracing::info!("All background deliveries finished.");
    }
    tracing::info!("Shutdown complete.");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
