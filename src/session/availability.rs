//! On-device model availability and download monitoring.
//!
//! Availability is never stored: every check asks the runtime again. While a
//! download monitored by this manager is running, the last reported progress
//! is kept so status text can read `downloading NN%`.

use super::ProviderSessionManager;
use crate::config::{FeatureConfig, FeatureKind, ProviderKind};
use crate::error::AssistantError;
use crate::lock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityState {
    Unavailable,
    Downloadable,
    Downloading,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub state: AvailabilityState,
    pub status_text: String,
}

impl AvailabilityReport {
    pub fn new(state: AvailabilityState, progress: Option<u8>) -> Self {
        let status_text = match (state, progress) {
            (AvailabilityState::Unavailable, _) => "unavailable".to_string(),
            (AvailabilityState::Downloadable, _) => "downloadable".to_string(),
            (AvailabilityState::Downloading, Some(p)) => format!("downloading {}%", p),
            (AvailabilityState::Downloading, None) => "downloading".to_string(),
            (AvailabilityState::Available, _) => "available".to_string(),
        };
        Self { state, status_text }
    }
}

/// Events of a monitored download, as streamed across the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress { percent: u8 },
    Finished { report: AvailabilityReport },
}

impl ProviderSessionManager {
    /// Query the current availability of a feature's on-device model.
    ///
    /// Networked providers have no download step and always report available.
    pub async fn check_availability(
        &self,
        feature: FeatureKind,
        config: &FeatureConfig,
    ) -> Result<AvailabilityReport, AssistantError> {
        if config.provider != ProviderKind::OnDevice {
            return Ok(AvailabilityReport::new(AvailabilityState::Available, None));
        }
        if !self.on_device.is_supported(feature) {
            return Ok(AvailabilityReport::new(AvailabilityState::Unavailable, None));
        }

        let state = self
            .on_device
            .availability(feature, &config.on_device)
            .await?;
        let progress = if state == AvailabilityState::Downloading {
            lock(&self.downloads).get(&feature).copied()
        } else {
            None
        };
        log::debug!("SessionManager: {} availability is {:?}", feature, state);
        Ok(AvailabilityReport::new(state, progress))
    }

    /// Download the feature's model, forwarding progress (0-100) to
    /// `on_progress`, then re-query availability.
    pub async fn monitor_download<F>(
        &self,
        feature: FeatureKind,
        config: &FeatureConfig,
        cancel: CancellationToken,
        mut on_progress: F,
    ) -> Result<AvailabilityReport, AssistantError>
    where
        F: FnMut(u8) + Send,
    {
        if config.provider != ProviderKind::OnDevice || !self.on_device.is_supported(feature) {
            return Err(AssistantError::ProviderUnavailable {
                message: format!("no on-device model to download for {}", feature),
            });
        }

        log::info!("SessionManager: downloading on-device model for {}", feature);
        lock(&self.downloads).insert(feature, 0);

        let (tx, mut rx) = mpsc::channel::<u8>(32);
        let download = self.on_device.download(feature, &config.on_device, tx);
        tokio::pin!(download);

        let mut report = |percent: u8| {
            let percent = percent.min(100);
            lock(&self.downloads).insert(feature, percent);
            on_progress(percent);
        };

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(AssistantError::Cancelled),
                Some(percent) = rx.recv() => report(percent),
                finished = &mut download => {
                    while let Ok(percent) = rx.try_recv() {
                        report(percent);
                    }
                    break finished.map_err(AssistantError::from);
                }
            }
        };

        lock(&self.downloads).remove(&feature);
        match &result {
            Ok(()) => log::info!("SessionManager: download finished for {}", feature),
            Err(e) => log::warn!("SessionManager: download for {} ended: {}", feature, e),
        }
        result?;

        self.check_availability(feature, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        assert_eq!(
            AvailabilityReport::new(AvailabilityState::Downloading, Some(55)).status_text,
            "downloading 55%"
        );
        assert_eq!(
            AvailabilityReport::new(AvailabilityState::Downloadable, None).status_text,
            "downloadable"
        );
        assert_eq!(
            AvailabilityReport::new(AvailabilityState::Unavailable, Some(3)).status_text,
            "unavailable"
        );
    }

    #[test]
    fn test_download_event_wire_shape() {
        let event = DownloadEvent::Progress { percent: 10 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({ "event": "progress", "percent": 10 })
        );
    }
}
