mod grpc;
mod labeling;

pub use grpc::GrpcDetectionService;
pub use labeling::{label_detections, DetectedObject};

use crate::image_codec::{EncodeError, SharedImage};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tonic::{async_trait, Status};

/// One box as reported by the detector. Both box conventions come straight
/// from the collaborator; nothing here converts between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_index: u32,
    pub confidence: f32,
    pub xyxy: [f32; 4],
    pub xywh: [f32; 4],
}

/// Detections for one frame, in detector output order, with the detector's
/// class-name table.
#[derive(Debug, Clone, Default)]
pub struct DetectorOutput {
    pub detections: Vec<RawDetection>,
    pub class_names: Arc<Vec<String>>,
}

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Failed to connect to gRPC server: {0}")]
    ConnectionFailed(#[from] tonic::transport::Error),
    #[error("Maximum connection retries exceeded.")]
    MaxRetriesExceeded,
    #[error("gRPC request failed: {0}")]
    GrpcRequestFailed(#[from] Status),
    #[error("Detection timed out after {0:?}")]
    Timeout(Duration),
    #[error("Image encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

#[async_trait]
pub trait DetectionModel: Send + Sync + 'static {
    async fn detect(&self, image: SharedImage) -> Result<DetectorOutput, DetectionError>;
}
