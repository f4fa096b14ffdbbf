use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Duration;

pub const UPLOAD_OK: &str = "ok";
pub const DELIVERY_OK: &str = "ok";
pub const DELIVERY_FAILED: &str = "failed";
pub const DELIVERY_TIMED_OUT: &str = "timed_out";
pub const DELIVERY_ABORTED: &str = "aborted";

pub struct Metrics {
    uploads: IntCounterVec,
    deliveries: IntCounterVec,
    stage_duration: HistogramVec,
    background_tasks: IntGauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let uploads = IntCounterVec::new(
            Opts::new("uploads_total", "Total number of image uploads by outcome"),
            &["outcome"],
        )?;

        let deliveries = IntCounterVec::new(
            Opts::new(
                "deliveries_total",
                "Total number of background sink deliveries by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;

        // 5ms .. ~164s
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "stage_duration_seconds",
                "Duration of pipeline stages in seconds",
            )
            .buckets(exponential_buckets(0.005, 2.0, 16)?),
            &["stage"],
        )?;

        let background_tasks = IntGauge::new(
            "background_tasks",
            "Number of delivery tasks admitted and not yet finished",
        )?;

        registry.register(Box::new(uploads.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(background_tasks.clone()))?;

        Ok(Metrics {
            uploads,
            deliveries,
            stage_duration,
            background_tasks,
            registry,
        })
    }

    pub fn record_upload(&self, outcome: &str) {
        self.uploads.with_label_values(&[outcome]).inc();
    }

    pub fn record_delivery(&self, kind: &str, outcome: &str) {
        self.deliveries.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_stage_duration(&self, stage: &str, duration: Duration) {
        self.stage_duration
            .with_label_values(&[stage])
            .observe(duration.as_secs_f64());
    }

    pub fn task_started(&self) {
        self.background_tasks.inc();
    }

    pub fn task_finished(&self) {
        self.background_tasks.dec();
    }

    #[cfg(test)]
    pub fn uploads_count(&self, outcome: &str) -> u64 {
        self.uploads.with_label_values(&[outcome]).get()
    }

    #[cfg(test)]
    pub fn deliveries_count(&self, kind: &str, outcome: &str) -> u64 {
        self.deliveries.with_label_values(&[kind, outcome]).get()
    }
}
