//! Default output device via rodio.

use super::playback::{AudioOutput, PlaybackItem};
use crate::error::AssistantError;
use async_trait::async_trait;
use rodio::{Decoder, OutputStreamBuilder, Sink};
use std::io::Cursor;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

// Dropping the stream stops playback; leave room for slow devices to drain.
const TAIL_PAD: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy)]
pub struct RodioOutput {
    volume: f32,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self { volume: 1.0 }
    }

    pub fn with_volume(volume: f32) -> Self {
        Self {
            volume: volume.clamp(0.0, 2.0),
        }
    }
}

impl Default for RodioOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioOutput for RodioOutput {
    async fn play(&self, item: &PlaybackItem, cancel: CancellationToken) -> Result<(), AssistantError> {
        let bytes = item.audio.bytes().to_vec();
        let volume = self.volume;
        // The output stream is not Send; it lives on a blocking thread.
        tokio::task::spawn_blocking(move || play_blocking(bytes, volume, cancel))
            .await
            .map_err(|e| AssistantError::provider(format!("audio output task failed: {}", e)))?
    }
}

fn play_blocking(bytes: Vec<u8>, volume: f32, cancel: CancellationToken) -> Result<(), AssistantError> {
    let stream = OutputStreamBuilder::open_default_stream()
        .map_err(|e| AssistantError::provider(format!("no audio output device: {}", e)))?;
    let sink = Sink::connect_new(stream.mixer());
    let source = Decoder::new(Cursor::new(bytes))
        .map_err(|e| AssistantError::provider(format!("could not decode audio: {}", e)))?;

    sink.set_volume(volume);
    sink.append(source);

    while !sink.empty() {
        if cancel.is_cancelled() {
            sink.stop();
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }
    thread::sleep(TAIL_PAD);
    Ok(())
}
