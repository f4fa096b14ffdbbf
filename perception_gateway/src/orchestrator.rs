use crate::{
    annotate::{render_annotated_jpeg, Annotator},
    caption::{accumulate_caption, CaptionError, CaptionModel},
    config::{Config, LabelNumbering},
    correlation::{new_id, RequestId},
    detection::{label_detections, DetectionError, DetectionModel},
    image_codec::{decode_image, encode_jpeg_blocking, DecodeError, EncodeError, SharedImage},
    sink::{CaptionDelivery, DetectionDelivery, ResultSink, SinkError},
    telemetry::{Metrics, UPLOAD_OK},
    worker_pool::{BackgroundPool, DeliveryKind},
};
use bytes::Bytes;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadResponse {
    pub id: RequestId,
    pub caption: String,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid image: {0}")]
    Decode(#[from] DecodeError),
    #[error("Captioning failed: {0}")]
    Caption(#[from] CaptionError),
    #[error("Captioning timed out after {0:?}")]
    CaptionTimeout(Duration),
    #[error("Image task failed: {0}")]
    TaskFailed(String),
}

impl OrchestratorError {
    pub fn outcome(&self) -> &'static str {
        match self {
            OrchestratorError::Decode(_) => "invalid_image",
            OrchestratorError::Caption(_) => "caption_failed",
            OrchestratorError::CaptionTimeout(_) => "caption_timeout",
            OrchestratorError::TaskFailed(_) => "error",
        }
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("Image encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("Sink delivery failed: {0}")]
    Sink(#[from] SinkError),
}

/// The three external parties a request talks to, built once at start-up.
#[derive(Clone)]
pub struct Collaborators {
    pub captioner: Arc<dyn CaptionModel>,
    pub detector: Arc<dyn DetectionModel>,
    pub sink: Arc<dyn ResultSink>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_upload_bytes: usize,
    pub default_prompt: String,
    pub end_marker: String,
    pub caption_timeout: Duration,
    pub label_numbering: LabelNumbering,
    pub jpeg_quality: u8,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_upload_bytes: config.server.max_upload_bytes,
            default_prompt: config.caption.default_prompt.clone(),
            end_marker: config.caption.end_marker.clone(),
            caption_timeout: config.caption.get_timeout(),
            label_numbering: config.detection.label_numbering,
            jpeg_quality: config.annotation.jpeg_quality,
        }
    }
}

/// Runs one upload: decode, caption synchronously, then hand the caption and
/// detection deliveries to the background pool under a fresh id.
pub struct Orchestrator {
    collaborators: Collaborators,
    annotator: Arc<Annotator>,
    pool: BackgroundPool,
    settings: OrchestratorSettings,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        collaborators: Collaborators,
        annotator: Arc<Annotator>,
        pool: BackgroundPool,
        settings: OrchestratorSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            collaborators,
            annotator,
            pool,
            settings,
            metrics,
        }
    }

    pub fn pool(&self) -> &BackgroundPool {
        &self.pool
    }

    pub fn pending_deliveries(&self) -> usize {
        self.pool.pending()
    }

    #[instrument(skip(self, image_data, prompt), fields(bytes = image_data.len()))]
    pub async fn handle_upload(
        &self,
        image_data: Bytes,
        prompt: Option<String>,
    ) -> Result<UploadResponse, OrchestratorError> {
        let result = self.process(image_data, prompt).await;
        match &result {
            Ok(response) => {
                tracing::info!(id = %response.id, "Upload captioned, deliveries scheduled");
                self.metrics.record_upload(UPLOAD_OK);
            }
            Err(e) => {
                tracing::warn!("Upload rejected: {}", e);
                self.metrics.record_upload(e.outcome());
            }
        }
        result
    }

    async fn process(
        &self,
        image_data: Bytes,
        prompt: Option<String>,
    ) -> Result<UploadResponse, OrchestratorError> {
        let started = Instant::now();
        let max_bytes = self.settings.max_upload_bytes;
        let image = tokio::task::spawn_blocking(move || decode_image(&image_data, max_bytes))
            .await
            .map_err(|e| OrchestratorError::TaskFailed(e.to_string()))??;
        let image: SharedImage = Arc::new(image);
        self.metrics.record_stage_duration("decode", started.elapsed());

        let id = new_id();
        let prompt = prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_prompt.clone());

        let started = Instant::now();
        let caption = timeout(
            self.settings.caption_timeout,
            self.caption(image.clone(), &prompt),
        )
        .await
        .map_err(|_| OrchestratorError::CaptionTimeout(self.settings.caption_timeout))??;
        self.metrics.record_stage_duration("caption", started.elapsed());
        tracing::debug!(%id, "Caption: {}", caption);

        self.schedule_deliveries(id, image, caption.clone());

        Ok(UploadResponse { id, caption })
    }

    async fn caption(&self, image: SharedImage, prompt: &str) -> Result<String, CaptionError> {
        let fragments = self.collaborators.captioner.caption(image, prompt).await?;
        accumulate_caption(fragments, &self.settings.end_marker).await
    }

    fn schedule_deliveries(&self, id: RequestId, image: SharedImage, caption: String) {
        let caption_task = deliver_caption(
            self.collaborators.sink.clone(),
            id,
            caption,
            image.clone(),
            self.settings.jpeg_quality,
        );
        if let Err(e) = self.pool.spawn(DeliveryKind::Caption, id, caption_task) {
            tracing::warn!(%id, "Caption delivery not scheduled: {}", e);
        }

        let detection_task = detect_and_deliver(
            self.collaborators.clone(),
            self.annotator.clone(),
            self.metrics.clone(),
            id,
            image,
            self.settings.label_numbering,
            self.settings.jpeg_quality,
        );
        if let Err(e) = self.pool.spawn(DeliveryKind::Detections, id, detection_task) {
            tracing::warn!(%id, "Detection delivery not scheduled: {}", e);
        }
    }
}

async fn deliver_caption(
    sink: Arc<dyn ResultSink>,
    id: RequestId,
    caption: String,
    image: SharedImage,
    quality: u8,
) -> Result<(), DeliveryError> {
    let image_jpeg = encode_jpeg_blocking(image, quality).await?;
    sink.deliver_caption(&CaptionDelivery {
        id,
        caption,
        image_jpeg,
    })
    .await?;
    Ok(())
}

async fn detect_and_deliver(
    collaborators: Collaborators,
    annotator: Arc<Annotator>,
    metrics: Arc<Metrics>,
    id: RequestId,
    image: SharedImage,
    numbering: LabelNumbering,
    quality: u8,
) -> Result<(), DeliveryError> {
    let started = Instant::now();
    let output = collaborators.detector.detect(image.clone()).await?;
    metrics.record_stage_duration("detect", started.elapsed());

    let objects = label_detections(&output, numbering);
    tracing::debug!(%id, "Labelled {} detections", objects.len());

    let started = Instant::now();
    let annotated_jpeg = render_annotated_jpeg(annotator, image, objects.clone(), quality).await?;
    metrics.record_stage_duration("annotate", started.elapsed());

    collaborators
        .sink
        .deliver_detections(&DetectionDelivery {
            id,
            objects,
            annotated_jpeg,
        })
        .await?;
    Ok(())
}
