mod images;
mod sse;

use std::{env, pin::Pin};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

pub use images::{compress_data_url, payload_size_mb, ImageOptions};

use crate::sse::{delta_content, SseDecoder, SseEvent};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a virtual museum guide that explains the presented images \
and provides historical context about the artworks shown in the images you are given. \
Explain how the artwork was created. Keep your answers around 200 words. \
Analyze the image and answer the following question:";

/// Lazy, finite sequence of text fragments. End of stream means the
/// narration is complete; an `Err` item means the stream broke.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Images plus the question asked about them.
#[derive(Debug, Clone)]
pub struct NarrationRequest {
    /// Data URLs or bare base64 payloads.
    pub images: Vec<String>,
    pub question: String,
}

/// A generative model that narrates images token by token.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, request: &NarrationRequest) -> Result<TokenStream>;
}

#[derive(Debug, Clone)]
pub struct NarratorConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u16,
    pub system_prompt: String,
    pub image: ImageOptions,
}

impl NarratorConfig {
    /// Reads `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `NARRATION_MODEL` and
    /// `NARRATION_MAX_TOKENS`.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;
        let base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let model = env::var("NARRATION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let max_tokens = env::var("NARRATION_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Ok(Self {
            api_key,
            base_url,
            model,
            max_tokens,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            image: ImageOptions::default(),
        })
    }
}

/// Structure for the OpenAI Chat API request
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u16,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Content<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Content<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

/// Streams chat completions for image narration.
pub struct OpenAiNarrator {
    client: reqwest::Client,
    config: NarratorConfig,
}

impl OpenAiNarrator {
    pub fn new(config: NarratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build narration HTTP client")?;
        Ok(Self { client, config })
    }

    /// Compress every image on the blocking pool; images that cannot be
    /// decoded are left out.
    async fn prepare_images(&self, images: &[String]) -> Result<Vec<String>> {
        let images = images.to_vec();
        let options = self.config.image;
        tokio::task::spawn_blocking(move || compress_all(&images, options))
            .await
            .context("image compression task failed")
    }
}

fn compress_all(images: &[String], options: ImageOptions) -> Vec<String> {
    images
        .iter()
        .enumerate()
        .filter_map(|(i, image)| {
            debug!(index = i, size_mb = payload_size_mb(image), "compressing image");
            match compress_data_url(image, options) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(index = i, "dropping image: {e:#}");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl Narrator for OpenAiNarrator {
    async fn narrate(&self, request: &NarrationRequest) -> Result<TokenStream> {
        let images = self.prepare_images(&request.images).await?;
        if images.is_empty() {
            anyhow::bail!("none of the {} images could be decoded", request.images.len());
        }

        let mut parts = vec![ContentPart::Text {
            text: &request.question,
        }];
        parts.extend(images.into_iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url },
        }));

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                Message {
                    role: "system",
                    content: Content::Text(&self.config.system_prompt),
                },
                Message {
                    role: "user",
                    content: Content::Parts(parts),
                },
            ],
            max_tokens: self.config.max_tokens,
            stream: true,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("narration request failed")?
            .error_for_status()
            .context("narration endpoint returned an error status")?;

        let mut body = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::default();
            'body: while let Some(chunk) = body.next().await {
                let chunk = chunk.context("narration stream interrupted")?;
                for event in decoder.feed(&chunk) {
                    match event {
                        SseEvent::Done => break 'body,
                        SseEvent::Data(data) => {
                            if let Some(fragment) = delta_content(&data)? {
                                yield fragment;
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
