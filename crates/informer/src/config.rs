use std::time::Duration;

use tern_core::ListOptions;
use tern_store::DeltaCompression;

/// Retry pacing for failed List/Watch cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// A cycle that stayed healthy this long resets the delay to `initial`.
    pub reset_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(800),
            max: Duration::from_secs(30),
            factor: 2.0,
            reset_after: Duration::from_secs(120),
        }
    }
}

/// Runtime configuration for one informer (reflector + processing loop).
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Used in logs and metrics labels.
    pub name: String,
    /// Period of the synthetic full-state replay; `None` disables it.
    pub resync_period: Option<Duration>,
    pub watch_timeout: Option<Duration>,
    pub allow_bookmarks: bool,
    pub backoff: BackoffConfig,
    pub compression: DeltaCompression,
    pub list_options: ListOptions,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            name: "informer".to_string(),
            resync_period: None,
            watch_timeout: Some(Duration::from_secs(300)),
            allow_bookmarks: true,
            backoff: BackoffConfig::default(),
            compression: DeltaCompression::default(),
            list_options: ListOptions::default(),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

impl InformerConfig {
    /// Defaults overridden by `TERN_*` environment variables.
    ///
    /// - `TERN_RESYNC_SECS` (0 disables resync)
    /// - `TERN_WATCH_TIMEOUT_SECS` (0 leaves the timeout to the server)
    /// - `TERN_WATCH_BACKOFF_INITIAL_MS`
    /// - `TERN_WATCH_BACKOFF_MAX_SECS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_u64("TERN_RESYNC_SECS") {
            cfg.resync_period = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = env_u64("TERN_WATCH_TIMEOUT_SECS") {
            cfg.watch_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = env_u64("TERN_WATCH_BACKOFF_INITIAL_MS") {
            cfg.backoff.initial = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_u64("TERN_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff.max = Duration::from_secs(secs.max(1));
        }
        cfg
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period.filter(|p| !p.is_zero());
        self
    }

    pub fn with_list_options(mut self, opts: ListOptions) -> Self {
        self.list_options = opts;
        self
    }

    pub fn with_compression(mut self, compression: DeltaCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}
