use super::{CaptionError, CaptionModel, FragmentStream};
use crate::{
    config::CaptionConfig,
    image_codec::{encode_jpeg_blocking, SharedImage},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tonic::async_trait;
use tracing::instrument;

const CAPTION_JPEG_QUALITY: u8 = 90;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

/// One line of the newline-delimited JSON body.
#[derive(Deserialize, Debug)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Captioning collaborator reached over an Ollama-compatible `/api/generate`
/// endpoint serving a vision-language model.
pub struct OllamaCaptionService {
    client: Client,
    generate_url: String,
    model: String,
}

impl OllamaCaptionService {
    pub fn new(config: &CaptionConfig) -> Result<Self, CaptionError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            generate_url: config.get_generate_url(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CaptionModel for OllamaCaptionService {
    #[instrument(skip(self, image, prompt), fields(model = %self.model))]
    async fn caption(&self, image: SharedImage, prompt: &str) -> Result<FragmentStream, CaptionError> {
        let jpeg = encode_jpeg_blocking(image, CAPTION_JPEG_QUALITY).await?;
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            images: vec![STANDARD.encode(&jpeg)],
            stream: true,
        };

        let response = self
            .client
            .post(&self.generate_url)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CaptionError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes_stream().map_err(CaptionError::from).boxed();
        Ok(ndjson_fragments(body))
    }
}

struct LineReader {
    body: BoxStream<'static, Result<Bytes, CaptionError>>,
    buf: Vec<u8>,
    body_finished: bool,
    stopped: bool,
}

impl LineReader {
    fn next_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            return Some(line);
        }
        if self.body_finished && !self.buf.is_empty() {
            return Some(std::mem::take(&mut self.buf));
        }
        None
    }
}

/// Splits a newline-delimited JSON body into caption fragments. The stream
/// ends after the chunk flagged `done`, on an `error` chunk, or when the body
/// ends.
fn ndjson_fragments(body: BoxStream<'static, Result<Bytes, CaptionError>>) -> FragmentStream {
    let reader = LineReader {
        body,
        buf: Vec::new(),
        body_finished: false,
        stopped: false,
    };

    stream::unfold(reader, |mut reader| async move {
        if reader.stopped {
            return None;
        }
        loop {
            if let Some(line) = reader.next_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = match serde_json::from_slice::<GenerateChunk>(&line) {
                    Ok(GenerateChunk {
                        error: Some(message),
                        ..
                    }) => {
                        reader.stopped = true;
                        Err(CaptionError::Service(message))
                    }
                    Ok(chunk) => {
                        reader.stopped = chunk.done;
                        Ok(chunk.response)
                    }
                    Err(e) => {
                        reader.stopped = true;
                        Err(CaptionError::from(e))
                    }
                };
                return Some((item, reader));
            }
            if reader.body_finished {
                return None;
            }
            match reader.body.next().await {
                Some(Ok(bytes)) => reader.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    reader.stopped = true;
                    return Some((Err(e), reader));
                }
                None => reader.body_finished = true,
            }
        }
    })
    .boxed()
}
