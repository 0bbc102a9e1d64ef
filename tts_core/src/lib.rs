mod decode;
mod transcode;
pub mod wav;

use std::{env, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use decode::{decode_clip, resample_mono, DecodedClip};
pub use transcode::{find_frame_sync, EncoderSettings, Mp3Transcoder, Transcoder};

/// Errors raised while turning a synthesized clip into canonical stream bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("no decodable audio track in clip")]
    NoAudioTrack,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("encoder already finished")]
    Finished,
}

/// Text to raw audio bytes.
///
/// Implementations are stateless per call; callers may issue several calls
/// concurrently and must not rely on completion order.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub voice: String,
    pub timeout: Duration,
}

impl SpeechConfig {
    /// Reads `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `TTS_MODEL` and `TTS_VOICE`.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;
        let base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let model = env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".into());
        let voice = env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".into());
        let timeout = env::var("TTS_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            api_key,
            base_url,
            model,
            voice,
            timeout,
        })
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
}

/// Speech synthesis over the OpenAI `/audio/speech` endpoint.
///
/// The voice and model are fixed for the lifetime of the client. Failed calls
/// are reported to the caller as-is and never retried here.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    config: SpeechConfig,
}

impl OpenAiSpeech {
    pub fn new(config: SpeechConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build speech HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn voice(&self) -> &str {
        &self.config.voice
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        let body = SpeechRequest {
            model: &self.config.model,
            voice: &self.config.voice,
            input: text,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("speech request failed")?
            .error_for_status()
            .context("speech endpoint returned an error status")?;

        let bytes = response
            .bytes()
            .await
            .context("failed to read speech response body")?;
        if bytes.is_empty() {
            anyhow::bail!("speech endpoint returned an empty clip");
        }
        Ok(bytes.to_vec())
    }
}
