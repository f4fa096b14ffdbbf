use crate::{
    annotate::Annotator,
    caption::{CaptionError, CaptionModel, FragmentStream},
    config::{LabelNumbering, WorkersConfig},
    detection::{DetectionError, DetectionModel, DetectorOutput, RawDetection},
    image_codec::SharedImage,
    orchestrator::{Collaborators, Orchestrator, OrchestratorSettings},
    sink::{CaptionDelivery, DetectionDelivery, ResultSink, SinkError},
    telemetry::Metrics,
    worker_pool::BackgroundPool,
};
use futures::{stream, StreamExt};
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tonic::{async_trait, Status};

pub fn test_image() -> SharedImage {
    Arc::new(RgbImage::from_fn(64, 48, |x, y| {
        Rgb([(x * 4) as u8, (y * 5) as u8, 90])
    }))
}

pub fn png_bytes() -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    test_image()
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

pub fn raw(class_index: u32, xyxy: [f32; 4]) -> RawDetection {
    RawDetection {
        class_index,
        confidence: 0.9,
        xyxy,
        xywh: [
            (xyxy[0] + xyxy[2]) / 2.0,
            (xyxy[1] + xyxy[3]) / 2.0,
            xyxy[2] - xyxy[0],
            xyxy[3] - xyxy[1],
        ],
    }
}

/// Captioner emitting a fixed fragment list, optionally after a delay.
pub struct MockCaptioner {
    fragments: Vec<String>,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockCaptioner {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl CaptionModel for MockCaptioner {
    async fn caption(&self, _image: SharedImage, prompt: &str) -> Result<FragmentStream, CaptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        if self.fail {
            return Err(CaptionError::Service("model unavailable".to_string()));
        }

        let delay = self.delay;
        let fragments = self.fragments.clone();
        Ok(stream::iter(fragments)
            .then(move |fragment| async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                Ok::<_, CaptionError>(fragment)
            })
            .boxed())
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Captioner streaming "a", "b" with a delay before each fragment. A call
/// counts as in flight until its fragment stream is dropped.
pub struct SlowCaptioner {
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl SlowCaptioner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptionModel for SlowCaptioner {
    async fn caption(&self, _image: SharedImage, _prompt: &str) -> Result<FragmentStream, CaptionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let in_flight = InFlight(self.in_flight.clone());

        let delay = self.delay;
        Ok(stream::iter(["a", "b"])
            .then(move |fragment| async move {
                sleep(delay).await;
                Ok::<_, CaptionError>(fragment.to_string())
            })
            .map(move |fragment| {
                let _in_flight = &in_flight;
                fragment
            })
            .boxed())
    }
}

/// Detector returning a fixed output.
pub struct MockDetector {
    output: DetectorOutput,
    delay: Duration,
    fail: bool,
}

impl MockDetector {
    pub fn new(detections: Vec<RawDetection>, names: &[&str]) -> Self {
        Self {
            output: DetectorOutput {
                detections,
                class_names: Arc::new(names.iter().map(|n| n.to_string()).collect()),
            },
            delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new(), &[])
        }
    }
}

#[async_trait]
impl DetectionModel for MockDetector {
    async fn detect(&self, _image: SharedImage) -> Result<DetectorOutput, DetectionError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.fail {
            return Err(DetectionError::GrpcRequestFailed(Status::unavailable(
                "detector down",
            )));
        }
        Ok(self.output.clone())
    }
}

/// Detector that sleeps and records how many calls overlapped.
pub struct SlowDetector {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowDetector {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionModel for SlowDetector {
    async fn detect(&self, _image: SharedImage) -> Result<DetectorOutput, DetectionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(DetectorOutput::default())
    }
}

/// Sink keeping every delivery in memory.
#[derive(Default)]
pub struct RecordingSink {
    pub captions: Mutex<Vec<CaptionDelivery>>,
    pub detections: Mutex<Vec<DetectionDelivery>>,
    fail_captions: bool,
    fail_detections: bool,
    delay: Duration,
    detection_delay: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_detections() -> Self {
        Self {
            fail_detections: true,
            ..Self::default()
        }
    }

    pub fn failing_captions() -> Self {
        Self {
            fail_captions: true,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stalls detection deliveries only; captions go through at once.
    pub fn with_detection_delay(mut self, delay: Duration) -> Self {
        self.detection_delay = delay;
        self
    }
}

fn unreachable_sink() -> SinkError {
    SinkError::UnexpectedStatus {
        status: 503,
        body: "sink unreachable".to_string(),
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn deliver_caption(&self, delivery: &CaptionDelivery) -> Result<(), SinkError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.fail_captions {
            return Err(unreachable_sink());
        }
        self.captions.lock().push(delivery.clone());
        Ok(())
    }

    async fn deliver_detections(&self, delivery: &DetectionDelivery) -> Result<(), SinkError> {
        let delay = self.delay + self.detection_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.fail_detections {
            return Err(unreachable_sink());
        }
        self.detections.lock().push(delivery.clone());
        Ok(())
    }
}

pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_upload_bytes: 1024 * 1024,
        default_prompt: "Describe the scene.".to_string(),
        end_marker: "<END>".to_string(),
        caption_timeout: Duration::from_secs(5),
        label_numbering: LabelNumbering::Descending,
        jpeg_quality: 80,
    }
}

/// Orchestrator over in-memory collaborators with a 16-task pool.
pub fn test_orchestrator(
    captioner: Arc<dyn CaptionModel>,
    detector: Arc<dyn DetectionModel>,
    sink: Arc<dyn ResultSink>,
    settings: OrchestratorSettings,
    metrics: Arc<Metrics>,
) -> Orchestrator {
    test_orchestrator_with_workers(captioner, detector, sink, settings, metrics, 16)
}

pub fn test_orchestrator_with_workers(
    captioner: Arc<dyn CaptionModel>,
    detector: Arc<dyn DetectionModel>,
    sink: Arc<dyn ResultSink>,
    settings: OrchestratorSettings,
    metrics: Arc<Metrics>,
    max_background_tasks: usize,
) -> Orchestrator {
    let pool = BackgroundPool::new(
        &WorkersConfig {
            max_background_tasks,
            task_timeout_ms: 10_000,
            shutdown_grace_ms: 10_000,
        },
        metrics.clone(),
    );
    Orchestrator::new(
        Collaborators {
            captioner,
            detector,
            sink,
        },
        Arc::new(Annotator::without_labels(2)),
        pool,
        settings,
        metrics,
    )
}
