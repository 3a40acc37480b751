//! Sequential audio playback.
//!
//! One worker task plays queued items strictly one at a time. Items carry the
//! speech session that produced them so a whole utterance can be dropped
//! without touching audio of a newer one.

use super::lipsync::SceneClip;
use super::{AudioUnit, DeviceHandoff};
use crate::error::AssistantError;
use crate::lock;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identifies one `speak` call. Ids only grow.
pub type SpeechSessionId = u64;

#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub session: SpeechSessionId,
    /// Position of the chunk within its session.
    pub sequence: usize,
    pub audio: AudioUnit,
    pub scene: Option<SceneClip>,
}

/// The audio device.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play one item to completion, returning early once `cancel` fires.
    async fn play(&self, item: &PlaybackItem, cancel: CancellationToken) -> Result<(), AssistantError>;
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<PlaybackItem>,
    stopped: bool,
    /// Sessions at or below this id were stopped; their audio is refused.
    cutoff: SpeechSessionId,
    latest: SpeechSessionId,
    current: Option<(SpeechSessionId, CancellationToken)>,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
}

pub struct PlaybackQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl PlaybackQueue {
    /// Start the playback worker. Must be called inside a Tokio runtime.
    pub fn new(output: Arc<dyn AudioOutput>, handoff: Arc<DeviceHandoff>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), output, handoff));
        Self { shared, worker }
    }

    /// Queue an item. Returns `false` if it was refused (queue stopped, or
    /// the item belongs to a stopped session).
    pub fn enqueue(&self, item: PlaybackItem) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.stopped || item.session <= state.cutoff {
                log::debug!(
                    "Playback: refused chunk {} of session {}",
                    item.sequence,
                    item.session
                );
                return false;
            }
            state.latest = state.latest.max(item.session);
            state.items.push_back(item);
        }
        self.shared.wake.notify_one();
        true
    }

    /// Halt the current item and drop everything queued so far.
    pub fn stop(&self) {
        let mut state = lock(&self.shared.state);
        let playing = state.current.as_ref().map(|(s, _)| *s).unwrap_or(0);
        let cutoff = state.cutoff.max(state.latest).max(playing);
        state.cutoff = cutoff;
        state.stopped = true;
        let before = state.items.len();
        state.items.retain(|item| item.session > cutoff);
        if let Some((_, token)) = &state.current {
            token.cancel();
        }
        log::info!(
            "Playback: stopped (dropped {} queued chunks)",
            before - state.items.len()
        );
    }

    pub fn resume(&self) {
        let resumed = {
            let mut state = lock(&self.shared.state);
            std::mem::replace(&mut state.stopped, false)
        };
        if resumed {
            log::debug!("Playback: resumed");
            self.shared.wake.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.shared.state).stopped
    }

    /// Drop queued audio of one session and halt it if it is playing.
    /// Returns the number of queued items removed.
    pub fn clear_session(&self, session: SpeechSessionId) -> usize {
        let mut state = lock(&self.shared.state);
        let before = state.items.len();
        state.items.retain(|item| item.session != session);
        if let Some((current, token)) = &state.current {
            if *current == session {
                token.cancel();
            }
        }
        before - state.items.len()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.shared.state).current.is_some()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared.state).items.len()
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(shared: Arc<Shared>, output: Arc<dyn AudioOutput>, handoff: Arc<DeviceHandoff>) {
    loop {
        let next = {
            let mut state = lock(&shared.state);
            if state.stopped {
                None
            } else {
                state.items.pop_front().map(|item| {
                    let token = CancellationToken::new();
                    state.current = Some((item.session, token.clone()));
                    (item, token)
                })
            }
        };

        let Some((item, token)) = next else {
            shared.wake.notified().await;
            continue;
        };

        tokio::select! {
            _ = handoff.wait_settled() => {}
            _ = token.cancelled() => {}
        }

        if !token.is_cancelled() {
            log::debug!("Playback: playing chunk {} of session {}", item.sequence, item.session);
            if let Err(e) = output.play(&item, token.clone()).await {
                log::warn!("Playback: chunk {} of session {} failed: {}", item.sequence, item.session, e);
            }
        }

        lock(&shared.state).current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// (session, sequence, cancelled, started)
    type Played = (SpeechSessionId, usize, bool, Instant);

    struct TestOutput {
        hold: Duration,
        played: mpsc::UnboundedSender<Played>,
    }

    #[async_trait]
    impl AudioOutput for TestOutput {
        async fn play(&self, item: &PlaybackItem, cancel: CancellationToken) -> Result<(), AssistantError> {
            let started = Instant::now();
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(self.hold) => false,
                _ = cancel.cancelled() => true,
            };
            let _ = self.played.send((item.session, item.sequence, cancelled, started));
            Ok(())
        }
    }

    fn queue(hold: Duration, handoff: Arc<DeviceHandoff>) -> (PlaybackQueue, mpsc::UnboundedReceiver<Played>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let output = Arc::new(TestOutput { hold, played: tx });
        (PlaybackQueue::new(output, handoff), rx)
    }

    fn item(session: SpeechSessionId, sequence: usize) -> PlaybackItem {
        PlaybackItem {
            session,
            sequence,
            audio: AudioUnit::new(vec![0; 4], "audio/wav"),
            scene: None,
        }
    }

    async fn wait_until_playing(queue: &PlaybackQueue) {
        while !queue.is_playing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_play_in_order() {
        let (queue, mut played) = queue(Duration::from_millis(100), Arc::new(DeviceHandoff::default()));
        for seq in 0..3 {
            assert!(queue.enqueue(item(1, seq)));
        }
        for seq in 0..3 {
            let (session, sequence, cancelled, _) = played.recv().await.unwrap();
            assert_eq!((session, sequence, cancelled), (1, seq, false));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_and_refuses_stale_sessions() {
        let (queue, mut played) = queue(Duration::from_secs(1), Arc::new(DeviceHandoff::default()));
        queue.enqueue(item(1, 0));
        queue.enqueue(item(1, 1));
        wait_until_playing(&queue).await;

        queue.stop();
        let (session, sequence, cancelled, _) = played.recv().await.unwrap();
        assert_eq!((session, sequence, cancelled), (1, 0, true));
        assert_eq!(queue.pending_len(), 0);

        assert!(!queue.enqueue(item(1, 2)));
        queue.resume();
        // late audio of the stopped session stays out
        assert!(!queue.enqueue(item(1, 3)));
        assert!(queue.enqueue(item(2, 0)));

        let (session, sequence, cancelled, _) = played.recv().await.unwrap();
        assert_eq!((session, sequence, cancelled), (2, 0, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_session_leaves_other_sessions() {
        let (queue, mut played) = queue(Duration::from_millis(500), Arc::new(DeviceHandoff::default()));
        queue.enqueue(item(1, 0));
        queue.enqueue(item(1, 1));
        queue.enqueue(item(2, 0));
        wait_until_playing(&queue).await;

        assert_eq!(queue.clear_session(1), 1);

        let first = played.recv().await.unwrap();
        assert_eq!((first.0, first.1, first.2), (1, 0, true));
        let second = played.recv().await.unwrap();
        assert_eq!((second.0, second.1, second.2), (2, 0, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_waits_for_device_settle() {
        let handoff = Arc::new(DeviceHandoff::new(Duration::from_millis(300)));
        let (queue, mut played) = queue(Duration::from_millis(10), handoff.clone());

        let released = Instant::now();
        handoff.mark_released();
        queue.enqueue(item(1, 0));

        let (_, _, _, started) = played.recv().await.unwrap();
        assert!(started - released >= Duration::from_millis(300));
    }
}
