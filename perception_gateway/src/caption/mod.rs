mod accumulator;
mod ollama;

pub use accumulator::{accumulate_caption, strip_marker, CaptionAccumulator};
pub use ollama::OllamaCaptionService;

use crate::image_codec::{EncodeError, SharedImage};
use futures::stream::BoxStream;
use thiserror::Error;
use tonic::async_trait;

/// Lazy, single-pass sequence of text fragments produced by a captioning model.
pub type FragmentStream = BoxStream<'static, Result<String, CaptionError>>;

#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("Caption request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Caption service returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("Malformed caption fragment: {0}")]
    MalformedFragment(#[from] serde_json::Error),
    #[error("Caption service error: {0}")]
    Service(String),
    #[error("Image encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

#[async_trait]
pub trait CaptionModel: Send + Sync + 'static {
    /// Starts captioning `image` and returns the fragment stream. The stream
    /// must be consumed to exhaustion to obtain the full caption.
    async fn caption(&self, image: SharedImage, prompt: &str) -> Result<FragmentStream, CaptionError>;
}
