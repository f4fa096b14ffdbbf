use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub caption: CaptionConfig,
    pub detection: DetectionConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub const DEFAULT_PROMPT: &str = "What do you see? Keep it brief and articulate, comment specifically \
on things that look in motion or have likely just changed, or on things the user is looking at. \
Assume the image is from the user's pov.";

#[derive(Debug, Deserialize, Clone)]
pub struct CaptionConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_prompt")]
    pub default_prompt: String,
    #[serde(default = "default_end_marker")]
    pub end_marker: String,
    #[serde(default = "default_caption_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub serialize_calls: bool,
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

fn default_end_marker() -> String {
    "<END>".to_string()
}

fn default_caption_timeout_ms() -> u64 {
    120_000
}

impl CaptionConfig {
    pub fn get_generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How per-class rank suffixes are assigned within one frame.
///
/// `Descending` numbers the first detection of a class with the class total
/// (`dog_2`, `dog_1`), which is what existing sink consumers receive.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LabelNumbering {
    #[default]
    Descending,
    Ascending,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,
    #[serde(default = "default_detection_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub label_numbering: LabelNumbering,
    #[serde(default)]
    pub serialize_calls: bool,
}

fn default_max_connect_retries() -> u32 {
    10
}

fn default_detection_timeout_ms() -> u64 {
    30_000
}

impl DetectionConfig {
    pub fn get_address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn get_request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub base_url: String,
    #[serde(default = "default_caption_path")]
    pub caption_path: String,
    #[serde(default = "default_detection_path")]
    pub detection_path: String,
    #[serde(default = "default_sink_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_caption_path() -> String {
    "/newTick".to_string()
}

fn default_detection_path() -> String {
    "/objectDetect".to_string()
}

fn default_sink_timeout_ms() -> u64 {
    10_000
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl SinkConfig {
    pub fn get_caption_url(&self) -> String {
        join_url(&self.base_url, &self.caption_path)
    }

    pub fn get_detection_url(&self) -> String {
        join_url(&self.base_url, &self.detection_path)
    }

    pub fn get_request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Delivery retry policy. `max_retries: 0` sends each delivery exactly once.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_max_elapsed_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    /// Permits per delivery kind; captions and detections are bounded separately.
    #[serde(default = "default_max_background_tasks")]
    pub max_background_tasks: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_max_background_tasks() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

fn default_task_timeout_ms() -> u64 {
    120_000
}

fn default_shutdown_grace_ms() -> u64 {
    15_000
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_background_tasks: default_max_background_tasks(),
            task_timeout_ms: default_task_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl WorkersConfig {
    pub fn get_task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn get_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotationConfig {
    /// TrueType font used for box labels. Boxes are drawn without text when unset.
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_line_thickness")]
    pub line_thickness: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_font_size() -> f32 {
    20.0
}

fn default_line_thickness() -> u32 {
    2
}

fn default_jpeg_quality() -> u8 {
    90
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            font_size: default_font_size(),
            line_thickness: default_line_thickness(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use one of `trace`, `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

fn configuration_directory() -> Result<PathBuf, config::ConfigError> {
    if let Ok(dir) = std::env::var("APP_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    Ok(base_path.join("configuration"))
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let configuration_directory = configuration_directory()?;

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("PG")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
