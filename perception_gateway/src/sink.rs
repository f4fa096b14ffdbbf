use crate::{
    config::{RetryConfig, SinkConfig},
    correlation::RequestId,
    detection::DetectedObject,
};
use bytes::Bytes;
use reqwest::{
    multipart::{Form, Part},
    Client,
};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tonic::async_trait;
use tracing::instrument;

pub const CAPTION_KIND: &str = "caption";
pub const DETECTIONS_KIND: &str = "detections";

#[derive(Debug, Clone)]
pub struct CaptionDelivery {
    pub id: RequestId,
    pub caption: String,
    pub image_jpeg: Bytes,
}

#[derive(Debug, Clone)]
pub struct DetectionDelivery {
    pub id: RequestId,
    pub objects: Vec<DetectedObject>,
    pub annotated_jpeg: Bytes,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Sink returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("Failed to serialize detections: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SinkError {
    /// Transport failures and 5xx answers may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::RequestFailed(e) => !e.is_builder(),
            SinkError::UnexpectedStatus { status, .. } => *status >= 500,
            SinkError::Serialize(_) => false,
        }
    }
}

/// Downstream consumer of caption and detection results.
#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    async fn deliver_caption(&self, delivery: &CaptionDelivery) -> Result<(), SinkError>;
    async fn deliver_detections(&self, delivery: &DetectionDelivery) -> Result<(), SinkError>;
}

/// Posts results as `multipart/form-data` to two endpoints under one base URL.
pub struct HttpSink {
    client: Client,
    caption_url: String,
    detection_url: String,
    retry: RetryConfig,
}

impl HttpSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(config.get_request_timeout())
            .build()?;

        Ok(Self {
            client,
            caption_url: config.get_caption_url(),
            detection_url: config.get_detection_url(),
            retry: config.retry.clone(),
        })
    }

    async fn post_once(&self, url: &str, form: Form) -> Result<(), SinkError> {
        let response = self.client.post(url).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// A multipart body can only be sent once, so `build_form` is called
    /// again for every attempt.
    async fn post_with_retry<F>(&self, kind: &str, url: &str, build_form: F) -> Result<(), SinkError>
    where
        F: Fn() -> Result<Form, SinkError>,
    {
        let started = Instant::now();
        let max_elapsed = Duration::from_millis(self.retry.max_elapsed_ms);
        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);
        let mut attempt = 0;

        loop {
            let error = match self.post_once(url, build_form()?).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= self.retry.max_retries
                || !error.is_retryable()
                || started.elapsed() + delay > max_elapsed
            {
                return Err(error);
            }

            attempt += 1;
            tracing::warn!(
                "{} delivery attempt {} failed, retrying in {:?}: {}",
                kind,
                attempt,
                delay,
                error
            );
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(delay.mul_f32(jitter)).await;
            delay = delay.saturating_mul(self.retry.backoff_factor.max(1));
        }
    }
}

fn jpeg_part(jpeg: &Bytes) -> Result<Part, SinkError> {
    Ok(Part::bytes(jpeg.to_vec())
        .file_name("image.jpeg")
        .mime_str("image/jpeg")?)
}

pub fn caption_form(delivery: &CaptionDelivery) -> Result<Form, SinkError> {
    Ok(Form::new()
        .text("id", delivery.id.to_string())
        .text("caption", delivery.caption.clone())
        .part("image", jpeg_part(&delivery.image_jpeg)?))
}

pub fn detection_form(delivery: &DetectionDelivery) -> Result<Form, SinkError> {
    Ok(Form::new()
        .text("id", delivery.id.to_string())
        .text("detected_objects", serde_json::to_string(&delivery.objects)?)
        .part("image", jpeg_part(&delivery.annotated_jpeg)?))
}

#[async_trait]
impl ResultSink for HttpSink {
    #[instrument(skip(self, delivery), fields(id = %delivery.id))]
    async fn deliver_caption(&self, delivery: &CaptionDelivery) -> Result<(), SinkError> {
        self.post_with_retry(CAPTION_KIND, &self.caption_url, || caption_form(delivery))
            .await
    }

    #[instrument(skip(self, delivery), fields(id = %delivery.id, objects = delivery.objects.len()))]
    async fn deliver_detections(&self, delivery: &DetectionDelivery) -> Result<(), SinkError> {
        self.post_with_retry(DETECTIONS_KIND, &self.detection_url, || {
            detection_form(delivery)
        })
        .await
    }
}
