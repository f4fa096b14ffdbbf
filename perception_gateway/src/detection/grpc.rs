use super::{DetectionError, DetectionModel, DetectorOutput, RawDetection};
use crate::{
    config::DetectionConfig,
    image_codec::{encode_jpeg_blocking, SharedImage},
};
use detection_proto::{
    detection_service_client::DetectionServiceClient, DetectRequest, Detection, Empty,
};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::time::{sleep, timeout, Duration};
use tonic::{async_trait, transport::Channel, Request};
use tracing::instrument;

const DETECTION_JPEG_QUALITY: u8 = 95;

/// Detection collaborator backed by the gRPC YOLO service.
///
/// The class-name table is fetched once when the client connects and shared
/// by every response.
pub struct GrpcDetectionService {
    client: DetectionServiceClient<Channel>,
    class_names: Arc<Vec<String>>,
    request_timeout: Duration,
}

impl GrpcDetectionService {
    pub async fn new(config: &DetectionConfig) -> Result<Self, DetectionError> {
        let mut client =
            Self::get_client(config.get_address(), config.max_connect_retries).await?;

        let response = client.get_class_names(Request::new(Empty {})).await?;
        let class_names = response.into_inner().names;
        tracing::info!("Loaded {} detection class names", class_names.len());

        Ok(Self {
            client,
            class_names: Arc::new(class_names),
            request_timeout: config.get_request_timeout(),
        })
    }

    async fn get_client(
        address: String,
        max_retries: u32,
    ) -> Result<DetectionServiceClient<Channel>, DetectionError> {
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let mut retry_count = 0;

        while retry_count < max_retries {
            match timeout(
                Duration::from_secs(1),
                DetectionServiceClient::connect(address.clone()),
            )
            .await
            {
                Ok(Ok(client)) => return Ok(client),
                Ok(Err(e)) => {
                    tracing::error!("Failed to connect to detection service: {:?}", e);
                }
                Err(_) => {
                    tracing::error!("Connection timeout");
                }
            }

            retry_count += 1;
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(DetectionError::MaxRetriesExceeded)
    }
}

fn to_raw_detection(detection: &Detection) -> RawDetection {
    RawDetection {
        class_index: detection.class_id,
        confidence: detection.confidence,
        xyxy: [detection.x1, detection.y1, detection.x2, detection.y2],
        xywh: [detection.xc, detection.yc, detection.w, detection.h],
    }
}

#[async_trait]
impl DetectionModel for GrpcDetectionService {
    #[instrument(skip(self, image))]
    async fn detect(&self, image: SharedImage) -> Result<DetectorOutput, DetectionError> {
        let image_data = encode_jpeg_blocking(image, DETECTION_JPEG_QUALITY).await?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let request = Request::new(DetectRequest {
            image_data: image_data.to_vec(),
            timestamp,
        });

        let mut client = self.client.clone();
        let response = timeout(self.request_timeout, client.detect(request))
            .await
            .map_err(|_| DetectionError::Timeout(self.request_timeout))??;
        let detections = response.into_inner().detections;

        tracing::debug!("Received {} detections", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class_id={}, confidence={:.3}, xywh=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_id,
                detection.confidence,
                detection.xc,
                detection.yc,
                detection.w,
                detection.h
            );
        }

        Ok(DetectorOutput {
            detections: detections.iter().map(to_raw_detection).collect(),
            class_names: self.class_names.clone(),
        })
    }
}
