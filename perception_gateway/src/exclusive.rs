use crate::{
    caption::{CaptionError, CaptionModel, FragmentStream},
    detection::{DetectionError, DetectionModel, DetectorOutput},
    image_codec::SharedImage,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::async_trait;

/// Single-slot lock around a collaborator that cannot serve concurrent calls.
///
/// For captioning the slot stays held until the fragment stream is dropped,
/// since generation keeps running while fragments are read.
pub struct Exclusive<S> {
    inner: S,
    slot: Arc<Mutex<()>>,
}

impl<S> Exclusive<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            slot: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl<C: CaptionModel> CaptionModel for Exclusive<C> {
    async fn caption(&self, image: SharedImage, prompt: &str) -> Result<FragmentStream, CaptionError> {
        let guard = self.slot.clone().lock_owned().await;
        let fragments = self.inner.caption(image, prompt).await?;
        Ok(fragments
            .map(move |fragment| {
                let _slot = &guard;
                fragment
            })
            .boxed())
    }
}

#[async_trait]
impl<D: DetectionModel> DetectionModel for Exclusive<D> {
    async fn detect(&self, image: SharedImage) -> Result<DetectorOutput, DetectionError> {
        let _slot = self.slot.lock().await;
        self.inner.detect(image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        caption::accumulate_caption,
        test_support::{test_image, SlowCaptioner, SlowDetector},
    };
    use std::time::Duration;
    use tokio::time::timeout;

    async fn caption_text<C: CaptionModel>(captioner: &C) -> Result<String, CaptionError> {
        let fragments = captioner.caption(test_image(), "Describe").await?;
        accumulate_caption(fragments, "<END>").await
    }

    #[tokio::test]
    async fn test_detect_calls_are_serialized() {
        let detector = Arc::new(Exclusive::new(SlowDetector::new(Duration::from_millis(30))));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let detector = detector.clone();
                tokio::spawn(async move { detector.detect(test_image()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(detector.inner.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_unwrapped_detector_runs_concurrently() {
        let detector = Arc::new(SlowDetector::new(Duration::from_millis(50)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let detector = detector.clone();
                tokio::spawn(async move { detector.detect(test_image()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(detector.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_caption_calls_are_serialized_until_stream_ends() {
        let captioner = Arc::new(Exclusive::new(SlowCaptioner::new(Duration::from_millis(20))));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let captioner = captioner.clone();
                tokio::spawn(async move { caption_text(captioner.as_ref()).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "ab");
        }

        assert_eq!(captioner.inner.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_unwrapped_captioner_streams_concurrently() {
        let captioner = Arc::new(SlowCaptioner::new(Duration::from_millis(50)));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let captioner = captioner.clone();
                tokio::spawn(async move { caption_text(captioner.as_ref()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(captioner.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_timed_out_caption_releases_the_slot() {
        let captioner = Exclusive::new(SlowCaptioner::new(Duration::from_millis(100)));

        let first = timeout(Duration::from_millis(30), caption_text(&captioner)).await;
        assert!(first.is_err());

        let second = timeout(Duration::from_secs(2), caption_text(&captioner)).await;
        assert_eq!(second.unwrap().unwrap(), "ab");
        assert_eq!(captioner.inner.max_in_flight(), 1);
    }
}
