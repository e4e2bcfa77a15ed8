//! Streaming settings source and cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use agentdesk_core::config::{self, StreamingSettings};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Source of the streaming timeout policy.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn load(&self) -> agentdesk_core::Result<StreamingSettings>;
}

/// Fixed settings.
#[derive(Debug, Clone, Default)]
pub struct StaticSettingsProvider(pub StreamingSettings);

#[async_trait]
impl SettingsProvider for StaticSettingsProvider {
    async fn load(&self) -> agentdesk_core::Result<StreamingSettings> {
        Ok(self.0.clone())
    }
}

/// Settings re-read from the configuration hierarchy on every load.
#[derive(Debug, Clone, Default)]
pub struct ConfigSettingsProvider {
    project_dir: Option<PathBuf>,
}

impl ConfigSettingsProvider {
    pub const fn new(project_dir: Option<PathBuf>) -> Self {
        Self { project_dir }
    }
}

#[async_trait]
impl SettingsProvider for ConfigSettingsProvider {
    async fn load(&self) -> agentdesk_core::Result<StreamingSettings> {
        let project_dir = self.project_dir.clone();
        tokio::task::spawn_blocking(move || config::load_config(project_dir.as_deref()))
            .await
            .map_err(|e| agentdesk_core::Error::Config(format!("settings task failed: {e}")))?
            .map(|config| config.streaming)
    }
}

/// Provider wrapper that reloads only after `refresh_interval` has passed.
pub struct CachedSettings {
    provider: Arc<dyn SettingsProvider>,
    cached: RwLock<Option<(StreamingSettings, Instant)>>,
}

impl CachedSettings {
    pub fn new(provider: Arc<dyn SettingsProvider>) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
        }
    }

    /// Current settings. A failed reload keeps the previous copy (or the
    /// defaults) and retries at the next refresh.
    pub async fn current(&self) -> StreamingSettings {
        if let Some((settings, loaded_at)) = self.cached.read().await.as_ref()
            && loaded_at.elapsed() < settings.refresh_interval()
        {
            return settings.clone();
        }

        let mut cached = self.cached.write().await;
        if let Some((settings, loaded_at)) = cached.as_ref()
            && loaded_at.elapsed() < settings.refresh_interval()
        {
            return settings.clone();
        }

        let settings = match self.provider.load().await {
            Ok(settings) => {
                debug!(?settings, "Loaded streaming settings");
                settings
            }
            Err(e) => {
                let fallback = cached
                    .as_ref()
                    .map(|(s, _)| s.clone())
                    .unwrap_or_default();
                warn!(error = %e, "Failed to load streaming settings, keeping previous");
                fallback
            }
        };
        *cached = Some((settings.clone(), Instant::now()));
        settings
    }

    /// Drop the cached copy so the next call reloads.
    pub async fn invalidate(&self) {
        self.cached.write().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        loads: AtomicUsize,
        settings: StreamingSettings,
    }

    #[async_trait]
    impl SettingsProvider for CountingProvider {
        async fn load(&self) -> agentdesk_core::Result<StreamingSettings> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.settings.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl SettingsProvider for FailingProvider {
        async fn load(&self) -> agentdesk_core::Result<StreamingSettings> {
            Err(agentdesk_core::Error::Config("unreadable".into()))
        }
    }

    #[tokio::test]
    async fn cache_serves_until_refresh() {
        let provider = Arc::new(CountingProvider {
            loads: AtomicUsize::new(0),
            settings: StreamingSettings::default(),
        });
        let cache = CachedSettings::new(Arc::clone(&provider) as Arc<dyn SettingsProvider>);

        cache.current().await;
        cache.current().await;
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);

        cache.invalidate().await;
        cache.current().await;
        assert_eq!(provider.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_refresh_interval_reloads_every_time() {
        let provider = Arc::new(CountingProvider {
            loads: AtomicUsize::new(0),
            settings: StreamingSettings {
                refresh_interval_seconds: 0,
                ..StreamingSettings::default()
            },
        });
        let cache = CachedSettings::new(Arc::clone(&provider) as Arc<dyn SettingsProvider>);
        cache.current().await;
        cache.current().await;
        assert_eq!(provider.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_load_falls_back_to_defaults() {
        let cache = CachedSettings::new(Arc::new(FailingProvider));
        assert_eq!(cache.current().await, StreamingSettings::default());
    }
}
