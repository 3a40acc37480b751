//! Per-feature status and in-flight cancellation handles.

use crate::config::FeatureKind;
use crate::error::{AssistantError, FeatureStatus};
use crate::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct TrackerState {
    statuses: HashMap<FeatureKind, FeatureStatus>,
    inflight: HashMap<u64, (FeatureKind, CancellationToken)>,
    next_id: u64,
}

#[derive(Default)]
pub(crate) struct Tracker {
    state: Mutex<TrackerState>,
}

impl Tracker {
    pub(crate) fn begin(self: &Arc<Self>, feature: FeatureKind) -> Ticket {
        self.track(feature, CancellationToken::new())
    }

    /// Like [`Tracker::begin`], but cancelling `parent` also cancels the
    /// operation.
    pub(crate) fn begin_linked(self: &Arc<Self>, feature: FeatureKind, parent: &CancellationToken) -> Ticket {
        self.track(feature, parent.child_token())
    }

    fn track(self: &Arc<Self>, feature: FeatureKind, token: CancellationToken) -> Ticket {
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = state.next_id;
            state.inflight.insert(id, (feature, token.clone()));
            state.statuses.insert(feature, FeatureStatus::InProgress);
            id
        };
        Ticket {
            tracker: self.clone(),
            id,
            feature,
            token,
            settled: false,
        }
    }

    /// Cancel every in-flight operation of a feature.
    pub(crate) fn abort(&self, feature: FeatureKind) -> usize {
        let state = lock(&self.state);
        let mut cancelled = 0;
        for (f, token) in state.inflight.values() {
            if *f == feature && !token.is_cancelled() {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub(crate) fn status(&self, feature: FeatureKind) -> FeatureStatus {
        lock(&self.state)
            .statuses
            .get(&feature)
            .cloned()
            .unwrap_or_default()
    }

    fn settle(&self, id: u64, feature: FeatureKind, status: Option<FeatureStatus>) {
        let mut state = lock(&self.state);
        state.inflight.remove(&id);
        let busy = state.inflight.values().any(|(f, _)| *f == feature);
        match status {
            Some(status) => {
                state.statuses.insert(feature, status);
            }
            None if !busy => {
                state.statuses.insert(feature, FeatureStatus::Idle);
            }
            None => {}
        }
    }
}

/// One tracked operation. Dropping it unsettled marks the feature idle.
pub(crate) struct Ticket {
    tracker: Arc<Tracker>,
    id: u64,
    feature: FeatureKind,
    token: CancellationToken,
    settled: bool,
}

impl Ticket {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn finish<T>(mut self, result: &Result<T, AssistantError>) {
        self.settled = true;
        self.tracker
            .settle(self.id, self.feature, Some(FeatureStatus::from_result(result)));
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.settle(self.id, self.feature, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_operation() {
        let tracker = Arc::new(Tracker::default());
        assert_eq!(tracker.status(FeatureKind::Chat), FeatureStatus::Idle);

        let ticket = tracker.begin(FeatureKind::Chat);
        assert_eq!(tracker.status(FeatureKind::Chat).to_string(), "in progress");
        ticket.finish(&Err::<(), _>(AssistantError::provider("boom")));
        assert_eq!(
            tracker.status(FeatureKind::Chat).to_string(),
            "failed: Provider error: boom"
        );

        let ticket = tracker.begin(FeatureKind::Chat);
        ticket.finish(&Ok(()));
        assert_eq!(tracker.status(FeatureKind::Chat).to_string(), "succeeded");
    }

    #[test]
    fn test_abort_cancels_only_that_feature() {
        let tracker = Arc::new(Tracker::default());
        let chat = tracker.begin(FeatureKind::Chat);
        let tts = tracker.begin(FeatureKind::TextToSpeech);

        assert_eq!(tracker.abort(FeatureKind::Chat), 1);
        assert!(chat.token().is_cancelled());
        assert!(!tts.token().is_cancelled());
        // already cancelled tokens are not counted twice
        assert_eq!(tracker.abort(FeatureKind::Chat), 0);
    }

    #[test]
    fn test_dropped_ticket_goes_idle() {
        let tracker = Arc::new(Tracker::default());
        let first = tracker.begin(FeatureKind::Summarize);
        let second = tracker.begin(FeatureKind::Summarize);
        drop(first);
        assert_eq!(tracker.status(FeatureKind::Summarize), FeatureStatus::InProgress);
        drop(second);
        assert_eq!(tracker.status(FeatureKind::Summarize), FeatureStatus::Idle);
    }
}
