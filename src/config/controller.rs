//! Live configuration: edits, debounced persistence and reconfiguration.

use super::{validate_feature_config, AppConfig, FeatureKind, ValidationReport};
use crate::error::AssistantError;
use crate::lock;
use crate::router::Router;
use crate::storage::Storage;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Key of the application configuration in the `config` namespace.
pub const CONFIG_KEY: &str = "app_config";

struct ControllerState {
    current: AppConfig,
    /// What was last persisted and pushed to the router.
    applied: AppConfig,
}

/// Owns the live [`AppConfig`].
///
/// Edits go through [`ConfigController::update`]. Each edit restarts the
/// auto-save timer; when it fires, the document is written once and only the
/// features whose configuration changed are reconfigured (chat first, so
/// inheriting features see its new provider).
pub struct ConfigController {
    storage: Storage,
    router: Arc<Router>,
    state: Mutex<ControllerState>,
    save_seq: AtomicU64,
    writes: AtomicU64,
    flushing: tokio::sync::Mutex<()>,
}

fn chat_first(mut features: Vec<FeatureKind>) -> Vec<FeatureKind> {
    features.sort_by_key(|f| *f != FeatureKind::Chat);
    features
}

impl ConfigController {
    pub fn new(storage: Storage, router: Arc<Router>) -> Self {
        Self {
            storage,
            router,
            state: Mutex::new(ControllerState {
                current: AppConfig::default(),
                applied: AppConfig::default(),
            }),
            save_seq: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Restore the persisted configuration (defaults when none) and push
    /// every feature to the router. Disabled features are registered but get
    /// no session.
    pub async fn load(&self) -> Result<AppConfig, AssistantError> {
        let stored: Option<AppConfig> = self.storage.config().load(CONFIG_KEY).await?;
        let config = match stored {
            Some(config) => {
                log::info!("Config: loaded persisted configuration");
                config
            }
            None => {
                log::info!("Config: no saved configuration, using defaults");
                AppConfig::default()
            }
        };

        {
            let mut state = lock(&self.state);
            state.current = config.clone();
            state.applied = config.clone();
        }
        self.apply(&config, FeatureKind::ALL.to_vec()).await;
        Ok(config)
    }

    pub fn current(&self) -> AppConfig {
        lock(&self.state).current.clone()
    }

    /// Edit the live configuration and schedule an auto-save.
    ///
    /// Must be called inside a Tokio runtime. Returns the edited document.
    pub fn update<F>(self: &Arc<Self>, edit: F) -> AppConfig
    where
        F: FnOnce(&mut AppConfig),
    {
        let snapshot = {
            let mut state = lock(&self.state);
            edit(&mut state.current);
            state.current.clone()
        };

        let seq = self.save_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = Duration::from_millis(snapshot.autosave_debounce_ms);
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if controller.save_seq.load(Ordering::SeqCst) != seq {
                return;
            }
            if let Err(e) = controller.flush().await {
                log::error!("Config: auto-save failed: {}", e);
            }
        });
        snapshot
    }

    /// Persist now and reconfigure the features that changed since the last
    /// save. Returns the reconfigured features. Does nothing when there are
    /// no unsaved edits.
    pub async fn flush(&self) -> Result<Vec<FeatureKind>, AssistantError> {
        let _flushing = self.flushing.lock().await;

        let (current, changed) = {
            let state = lock(&self.state);
            if state.current == state.applied {
                return Ok(Vec::new());
            }
            (
                state.current.clone(),
                state.current.changed_features(&state.applied),
            )
        };

        self.storage.config().save(CONFIG_KEY, &current).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.state).applied = current.clone();
        log::info!("Config: saved ({} feature(s) changed)", changed.len());

        let changed = chat_first(changed);
        self.apply(&current, changed.clone()).await;
        Ok(changed)
    }

    async fn apply(&self, config: &AppConfig, features: Vec<FeatureKind>) {
        for feature in chat_first(features) {
            if let Err(e) = self.router.configure(feature, config.feature(feature)).await {
                log::warn!("Config: could not apply {} configuration: {}", feature, e);
            }
        }
    }

    /// Validation reports of every enabled feature.
    pub fn validate(&self) -> BTreeMap<FeatureKind, ValidationReport> {
        let config = self.current();
        FeatureKind::ALL
            .iter()
            .map(|f| (*f, config.feature(*f)))
            .filter(|(_, c)| c.enabled)
            .map(|(f, c)| (f, validate_feature_config(f, &c)))
            .collect()
    }

    /// Number of configuration documents written so far.
    pub fn persisted_writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}
