//! On-device model runtime supplied by the host.
//!
//! The host (a browser with built-in models, a native inference runtime, ...)
//! implements [`OnDeviceRuntime`]. Sessions it creates are ordinary
//! [`TextProvider`]s; their `close` releases the model.

use super::{ProviderError, TextProvider};
use crate::config::{FeatureKind, OnDeviceSettings};
use crate::session::AvailabilityState;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait OnDeviceRuntime: Send + Sync {
    /// Whether the host can run this feature on-device at all.
    fn is_supported(&self, feature: FeatureKind) -> bool;

    /// Current model availability for the feature (and language pair).
    async fn availability(
        &self,
        feature: FeatureKind,
        settings: &OnDeviceSettings,
    ) -> Result<AvailabilityState, ProviderError>;

    /// Download the model, reporting progress (0-100) on `progress`.
    ///
    /// Resolves when the download finished or failed.
    async fn download(
        &self,
        feature: FeatureKind,
        settings: &OnDeviceSettings,
        progress: mpsc::Sender<u8>,
    ) -> Result<(), ProviderError>;

    async fn create_session(
        &self,
        feature: FeatureKind,
        settings: &OnDeviceSettings,
    ) -> Result<Arc<dyn TextProvider>, ProviderError>;
}

/// Runtime for hosts without on-device models.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedRuntime;

#[async_trait]
impl OnDeviceRuntime for UnsupportedRuntime {
    fn is_supported(&self, _feature: FeatureKind) -> bool {
        false
    }

    async fn availability(
        &self,
        _feature: FeatureKind,
        _settings: &OnDeviceSettings,
    ) -> Result<AvailabilityState, ProviderError> {
        Ok(AvailabilityState::Unavailable)
    }

    async fn download(
        &self,
        feature: FeatureKind,
        _settings: &OnDeviceSettings,
        _progress: mpsc::Sender<u8>,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "no on-device model for {} on this host",
            feature
        )))
    }

    async fn create_session(
        &self,
        feature: FeatureKind,
        _settings: &OnDeviceSettings,
    ) -> Result<Arc<dyn TextProvider>, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "no on-device model for {} on this host",
            feature
        )))
    }
}
