//! Common utilities for integration tests

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::Router;
use llm_core::{NarrationRequest, Narrator, TokenStream};
use server::{
    build_router,
    config::ServerConfig,
    metrics::PipelineMetrics,
    pipeline::{PipelineCoordinator, TranscoderFactory},
    session::{Session, SessionRegistry, SessionState},
    sink::SINK_HEADER,
    AppState,
};
use tempfile::TempDir;
use tts_core::{CodecError, EncoderSettings, Mp3Transcoder, SpeechSynthesizer, Transcoder};
use uuid::Uuid;

/// Narrator that replays fixed fragments, optionally breaking afterwards.
pub struct FakeNarrator {
    fragments: Vec<String>,
    break_at_end: bool,
    refuse: bool,
}

impl FakeNarrator {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            break_at_end: false,
            refuse: false,
        }
    }

    /// Yield the fragments, then an error instead of a clean end.
    pub fn breaking(fragments: &[&str]) -> Self {
        Self {
            break_at_end: true,
            ..Self::new(fragments)
        }
    }

    /// Fail before any fragment is produced.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(&[])
        }
    }
}

#[async_trait]
impl Narrator for FakeNarrator {
    async fn narrate(&self, _request: &NarrationRequest) -> anyhow::Result<TokenStream> {
        if self.refuse {
            anyhow::bail!("401 Unauthorized");
        }
        let mut items: Vec<anyhow::Result<String>> =
            self.fragments.iter().cloned().map(Ok).collect();
        if self.break_at_end {
            items.push(Err(anyhow::anyhow!("connection reset by peer")));
        }
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// Synthesizer returning `[text]` as the "audio", with scripted latency and
/// failures keyed by a substring of the sentence.
#[derive(Default)]
pub struct FakeSynthesizer {
    delays: Vec<(String, Duration)>,
    failures: Vec<String>,
    wav_ms: Option<u32>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, needle: &str, delay: Duration) -> Self {
        self.delays.push((needle.to_string(), delay));
        self
    }

    pub fn fail_on(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    /// Return a real WAV tone of `ms` milliseconds instead of text.
    pub fn wav(mut self, ms: u32) -> Self {
        self.wav_ms = Some(ms);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        self.calls.lock().unwrap().push(text.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, d)| *d)
            .unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failures.iter().any(|needle| text.contains(needle.as_str())) {
            anyhow::bail!("503 Service Unavailable");
        }
        match self.wav_ms {
            Some(ms) => tts_core::wav::encode_wav(&tts_core::wav::tone(440.0, ms, 22_050), 22_050),
            None => Ok(format!("[{text}]").into_bytes()),
        }
    }
}

/// Writes each clip followed by `|`, so the sink shows the order chunks were
/// applied in. Clips containing `CORRUPT` fail to transcode.
pub struct TaggingTranscoder;

impl Transcoder for TaggingTranscoder {
    fn transcode(&mut self, clip: &[u8]) -> Result<Vec<u8>, CodecError> {
        if clip.windows(7).any(|w| w == b"CORRUPT") {
            return Err(CodecError::Decode("corrupt clip".into()));
        }
        let mut out = clip.to_vec();
        out.push(b'|');
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(Vec::new())
    }
}

pub fn tagging_factory() -> TranscoderFactory {
    Arc::new(|| Ok(Box::new(TaggingTranscoder) as Box<dyn Transcoder>))
}

pub fn mp3_factory() -> TranscoderFactory {
    Arc::new(|| {
        Mp3Transcoder::new(EncoderSettings::default()).map(|t| Box::new(t) as Box<dyn Transcoder>)
    })
}

pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    pub fn coordinator(&self) -> &PipelineCoordinator {
        &self.state.coordinator
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.state.metrics
    }
}

pub fn test_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        audio_dir: dir.path().to_path_buf(),
        ..ServerConfig::default()
    }
}

/// Create a test app instance
pub fn create_test_app(
    narrator: FakeNarrator,
    synthesizer: Arc<FakeSynthesizer>,
    transcoder: TranscoderFactory,
) -> TestApp {
    create_test_app_with(narrator, synthesizer, transcoder, |_| {})
}

pub fn create_test_app_with(
    narrator: FakeNarrator,
    synthesizer: Arc<FakeSynthesizer>,
    transcoder: TranscoderFactory,
    tweak: impl FnOnce(&mut ServerConfig),
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);

    let registry = Arc::new(SessionRegistry::new(config.audio_dir.clone()));
    let coordinator = PipelineCoordinator::new(
        registry,
        Arc::new(narrator),
        synthesizer,
        transcoder,
        Arc::new(PipelineMetrics::new()),
        &config,
    );
    let state = AppState::new(coordinator, config);
    let router = build_router(state.clone());
    TestApp { dir, state, router }
}

pub fn request() -> NarrationRequest {
    NarrationRequest {
        images: vec!["data:image/png;base64,AAAA".to_string()],
        question: "How was this painted?".to_string(),
    }
}

/// Poll until the session leaves the active states.
pub async fn wait_until_settled(registry: &SessionRegistry, id: &Uuid) -> Arc<Session> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let session = registry.get(id).expect("session vanished");
        if !session.state().is_active() {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {id} stuck in {:?}",
            session.state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(registry: &SessionRegistry, id: &Uuid, want: SessionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match registry.get(id) {
            Some(session) if session.state() == want => return,
            None if want == SessionState::Deleted => return,
            _ => {}
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {want:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Sink bytes after the header.
pub fn sink_payload(session: &Session) -> Vec<u8> {
    let bytes = std::fs::read(session.sink().path()).unwrap();
    assert_eq!(&bytes[..SINK_HEADER.len()], &SINK_HEADER);
    bytes[SINK_HEADER.len()..].to_vec()
}
