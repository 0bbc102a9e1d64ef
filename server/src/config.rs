// Configuration constants for the server

use std::{path::PathBuf, time::Duration};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    /// Directory holding the per-session audio sinks.
    pub audio_dir: PathBuf,
    /// Sinks are deleted this long after their session was created.
    pub retention_secs: u64,
    /// Maximum distance between the oldest unwritten sentence and the newest
    /// sentence sent to synthesis.
    pub synthesis_window: usize,
    pub max_images: usize,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            audio_dir: PathBuf::from("audio"),
            retention_secs: 300,
            synthesis_window: 4,
            max_images: 4,
            max_body_bytes: 25 * 1024 * 1024,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect()
            });

        let audio_dir = std::env::var("AUDIO_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.audio_dir);

        Self {
            port: env_or("PORT", defaults.port),
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
            audio_dir,
            retention_secs: env_or("RETENTION_SECS", defaults.retention_secs),
            synthesis_window: env_or("SYNTHESIS_WINDOW", defaults.synthesis_window).max(1),
            max_images: env_or("MAX_IMAGES", defaults.max_images).max(1),
            max_body_bytes: env_or("MAX_BODY_BYTES", defaults.max_body_bytes),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
