use std::{net::SocketAddr, sync::Arc};

use axum::http::{HeaderValue, Method};
use llm_core::{Narrator, NarratorConfig, OpenAiNarrator};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tts_core::{EncoderSettings, Mp3Transcoder, OpenAiSpeech, SpeechConfig, SpeechSynthesizer, Transcoder};

use server::{
    build_router,
    config::ServerConfig,
    metrics::{mark_start, PipelineMetrics},
    pipeline::{PipelineCoordinator, TranscoderFactory},
    session::SessionRegistry,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting narration server...");
    mark_start();

    let config = ServerConfig::from_env();
    tokio::fs::create_dir_all(&config.audio_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", config.audio_dir.display()))?;

    let narrator: Arc<dyn Narrator> = Arc::new(OpenAiNarrator::new(NarratorConfig::from_env()?)?);
    let speech = OpenAiSpeech::new(SpeechConfig::from_env()?)?;
    info!("Speech synthesis voice: {}", speech.voice());
    let synthesizer: Arc<dyn SpeechSynthesizer> = Arc::new(speech);

    let settings = EncoderSettings::default();
    let transcoder: TranscoderFactory = Arc::new(move || {
        Mp3Transcoder::new(settings).map(|t| Box::new(t) as Box<dyn Transcoder>)
    });
    // fail at startup rather than on the first session
    Mp3Transcoder::new(settings)?;

    let registry = Arc::new(SessionRegistry::new(config.audio_dir.clone()));
    let coordinator = PipelineCoordinator::new(
        registry,
        narrator,
        synthesizer,
        transcoder,
        Arc::new(PipelineMetrics::new()),
        &config,
    );
    let state = AppState::new(coordinator, config.clone());

    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, audio_dir={}, retention={}s, synthesis_window={}",
        config.port,
        config.rate_limit_per_minute,
        config.audio_dir.display(),
        config.retention_secs,
        config.synthesis_window
    );

    let cors = cors_layer(&config);

    // Global key: the budget is shared by every client, which behaves the
    // same behind proxies as it does locally.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(((config.rate_limit_per_minute / 60).max(1)) as u64)
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors)
        .into_inner();

    let app = build_router(state).layer(middleware_stack);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(false);

    let Some(allowed_origins) = &config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return base.allow_origin(Any);
    };

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        base.allow_origin(Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(AllowOrigin::list(origins))
    }
}
