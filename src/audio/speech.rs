//! Text → chunked synthesis → playback.

use super::chunker::{split_for_speech, ChunkLimits};
use super::lipsync::SceneConverter;
use super::playback::{PlaybackItem, PlaybackQueue, SpeechSessionId};
use crate::error::AssistantError;
use crate::lock;
use crate::router::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakOptions {
    pub lip_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakReport {
    pub session: SpeechSessionId,
    pub chunks_total: usize,
    pub chunks_enqueued: usize,
    /// Synthesis ended early because the session was cancelled or playback
    /// refused its audio.
    pub cancelled: bool,
}

pub struct SpeechPipeline {
    router: Arc<Router>,
    playback: Arc<PlaybackQueue>,
    scene: Option<Arc<dyn SceneConverter>>,
    limits: ChunkLimits,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<SpeechSessionId, CancellationToken>>,
}

impl SpeechPipeline {
    pub fn new(router: Arc<Router>, playback: Arc<PlaybackQueue>, limits: ChunkLimits) -> Self {
        Self {
            router,
            playback,
            scene: None,
            limits,
            next_session: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Convert lip-sync motion into renderer clips before enqueueing.
    pub fn with_scene_converter(mut self, converter: Arc<dyn SceneConverter>) -> Self {
        self.scene = Some(converter);
        self
    }

    /// Speak `text` as a new session.
    ///
    /// Chunks are synthesized one after another and enqueued as soon as each
    /// is ready, so playback of the first chunk overlaps synthesis of the rest.
    pub async fn speak(&self, text: &str, options: SpeakOptions) -> Result<SpeakReport, AssistantError> {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        lock(&self.sessions).insert(session, token.clone());

        self.playback.resume();
        let result = self.run(session, text, options, &token).await;
        lock(&self.sessions).remove(&session);
        result
    }

    async fn run(
        &self,
        session: SpeechSessionId,
        text: &str,
        options: SpeakOptions,
        token: &CancellationToken,
    ) -> Result<SpeakReport, AssistantError> {
        let chunks = split_for_speech(text, self.limits);
        log::info!("Speech: session {} speaking {} chunks", session, chunks.len());

        let mut report = SpeakReport {
            session,
            chunks_total: chunks.len(),
            chunks_enqueued: 0,
            cancelled: false,
        };

        for (sequence, chunk) in chunks.iter().enumerate() {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let output = match self.router.synthesize_with_cancel(chunk, options.lip_sync, token).await {
                Ok(output) => output,
                Err(AssistantError::Cancelled) if token.is_cancelled() => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            };

            let scene = match (&self.scene, &output.motion) {
                (Some(converter), Some(motion)) => match converter.convert(&output.audio, motion).await {
                    Ok(clip) => Some(clip),
                    Err(e) => {
                        log::warn!("Speech: lip-sync scene failed, playing audio only: {}", e);
                        None
                    }
                },
                _ => None,
            };

            let accepted = !token.is_cancelled()
                && self.playback.enqueue(PlaybackItem {
                    session,
                    sequence,
                    audio: output.audio,
                    scene,
                });
            if !accepted {
                report.cancelled = true;
                break;
            }
            report.chunks_enqueued += 1;
        }

        Ok(report)
    }

    /// Stop synthesizing a session and drop its queued audio. Other sessions
    /// keep playing.
    pub fn cancel(&self, session: SpeechSessionId) {
        if let Some(token) = lock(&self.sessions).remove(&session) {
            token.cancel();
        }
        let dropped = self.playback.clear_session(session);
        log::info!("Speech: session {} cancelled ({} queued chunks dropped)", session, dropped);
    }

    /// Cancel every session and stop playback.
    pub fn stop_all(&self) {
        for (_, token) in lock(&self.sessions).drain() {
            token.cancel();
        }
        self.playback.stop();
    }

    pub fn active_sessions(&self) -> Vec<SpeechSessionId> {
        let mut ids: Vec<_> = lock(&self.sessions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
