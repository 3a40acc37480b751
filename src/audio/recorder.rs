//! Microphone capture → transcription.
//!
//! ## State machine
//! `Idle → Recording → Stopping → Idle`. Only one recording at a time. On stop
//! the capture device is released first, then the audio is transcribed; the
//! `on_recording_stopped` callback always fires last, after the recorder is
//! idle again.

use super::{encode_wav, AudioUnit, DeviceHandoff};
use crate::config::FeatureKind;
use crate::error::AssistantError;
use crate::lock;
use crate::router::Router;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// A source of microphone audio (browser media stream, cpal device, ...).
#[async_trait]
pub trait MicrophoneDevice: Send + Sync {
    /// Acquire the device and start capturing.
    async fn open(&self) -> Result<Box<dyn CaptureSession>, AssistantError>;
}

/// One open capture. Either method releases the device.
#[async_trait]
pub trait CaptureSession: Send {
    async fn finish(self: Box<Self>) -> Result<CapturedAudio, AssistantError>;

    async fn cancel(self: Box<Self>);
}

/// Audio as delivered by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedAudio {
    /// Already-encoded chunks (e.g. a media recorder's webm/opus pieces).
    Encoded { chunks: Vec<Vec<u8>>, mime_type: String },
    /// Raw interleaved samples in `[-1.0, 1.0]`.
    Pcm {
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    },
}

impl CapturedAudio {
    /// Assemble one audio unit; raw PCM becomes 16-bit WAV.
    pub fn into_audio_unit(self) -> Result<AudioUnit, AssistantError> {
        match self {
            CapturedAudio::Encoded { chunks, mime_type } => {
                let bytes = chunks.concat();
                if bytes.is_empty() {
                    return Err(AssistantError::recording("no audio was captured"));
                }
                Ok(AudioUnit::new(bytes, mime_type))
            }
            CapturedAudio::Pcm {
                samples,
                sample_rate,
                channels,
            } => {
                if samples.is_empty() {
                    return Err(AssistantError::recording("no audio was captured"));
                }
                let wav = encode_wav(&samples, sample_rate, channels.max(1))?;
                Ok(AudioUnit::new(wav, "audio/wav"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    #[default]
    Idle,
    Recording,
    Stopping,
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

pub struct RecordingCallbacks {
    pub on_transcription: Callback<String>,
    pub on_error: Callback<AssistantError>,
    pub on_recording_stopped: Box<dyn Fn() + Send + Sync>,
}

impl Default for RecordingCallbacks {
    fn default() -> Self {
        Self {
            on_transcription: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
            on_recording_stopped: Box::new(|| {}),
        }
    }
}

pub struct Recorder {
    router: Arc<Router>,
    device: Arc<dyn MicrophoneDevice>,
    handoff: Arc<DeviceHandoff>,
    callbacks: RecordingCallbacks,
    state: Mutex<RecorderState>,
    capture: Mutex<Option<Box<dyn CaptureSession>>>,
}

impl Recorder {
    pub fn new(router: Arc<Router>, device: Arc<dyn MicrophoneDevice>, handoff: Arc<DeviceHandoff>) -> Self {
        Self {
            router,
            device,
            handoff,
            callbacks: RecordingCallbacks::default(),
            state: Mutex::new(RecorderState::Idle),
            capture: Mutex::new(None),
        }
    }

    pub fn with_callbacks(mut self, callbacks: RecordingCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn state(&self) -> RecorderState {
        *lock(&self.state)
    }

    fn set_state(&self, state: RecorderState) {
        *lock(&self.state) = state;
    }

    pub async fn start_recording(&self) -> Result<(), AssistantError> {
        {
            let mut state = lock(&self.state);
            if *state != RecorderState::Idle {
                return Err(AssistantError::recording("a recording is already in progress"));
            }
            *state = RecorderState::Recording;
        }

        match self.open_capture().await {
            Ok(capture) => {
                *lock(&self.capture) = Some(capture);
                log::info!("Recorder: recording started");
                Ok(())
            }
            Err(e) => {
                self.set_state(RecorderState::Idle);
                log::warn!("Recorder: could not start recording: {}", e);
                Err(e)
            }
        }
    }

    async fn open_capture(&self) -> Result<Box<dyn CaptureSession>, AssistantError> {
        if !self.router.is_configured(FeatureKind::SpeechToText).await? {
            return Err(AssistantError::NotConfigured {
                feature: FeatureKind::SpeechToText,
            });
        }
        self.device.open().await
    }

    /// Stop capturing and transcribe what was recorded.
    pub async fn stop_recording(&self) -> Result<String, AssistantError> {
        {
            let mut state = lock(&self.state);
            if *state != RecorderState::Recording {
                return Err(AssistantError::recording("not recording"));
            }
            *state = RecorderState::Stopping;
        }

        let capture = lock(&self.capture).take();
        let result = match capture {
            Some(capture) => {
                let captured = capture.finish().await;
                self.handoff.mark_released();
                log::info!("Recorder: recording stopped, device released");
                self.transcribe(captured).await
            }
            None => Err(AssistantError::recording("capture session was lost")),
        };

        match &result {
            Ok(text) => (self.callbacks.on_transcription)(text.clone()),
            Err(e) => {
                log::error!("Recorder: transcription failed: {}", e);
                (self.callbacks.on_error)(e.clone());
            }
        }

        self.set_state(RecorderState::Idle);
        (self.callbacks.on_recording_stopped)();
        result
    }

    async fn transcribe(&self, captured: Result<CapturedAudio, AssistantError>) -> Result<String, AssistantError> {
        let audio = captured?.into_audio_unit()?;
        log::debug!("Recorder: transcribing {} bytes of {}", audio.len(), audio.mime_type());
        self.router.transcribe(audio).await
    }

    /// Abandon the current recording without transcribing.
    pub async fn cancel_recording(&self) {
        let capture = {
            let mut state = lock(&self.state);
            if *state != RecorderState::Recording {
                return;
            }
            *state = RecorderState::Stopping;
            lock(&self.capture).take()
        };

        if let Some(capture) = capture {
            capture.cancel().await;
            self.handoff.mark_released();
        }
        log::info!("Recorder: recording cancelled");
        self.set_state(RecorderState::Idle);
        (self.callbacks.on_recording_stopped)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decode_wav_mono;

    #[test]
    fn test_encoded_chunks_are_concatenated() {
        let captured = CapturedAudio::Encoded {
            chunks: vec![vec![1, 2], vec![3], vec![4, 5]],
            mime_type: "audio/webm".to_string(),
        };
        let unit = captured.into_audio_unit().unwrap();
        assert_eq!(unit.bytes(), &[1, 2, 3, 4, 5]);
        assert_eq!(unit.mime_type(), "audio/webm");
    }

    #[test]
    fn test_pcm_is_wav_encoded() {
        let captured = CapturedAudio::Pcm {
            samples: vec![0.1; 480],
            sample_rate: 48_000,
            channels: 1,
        };
        let unit = captured.into_audio_unit().unwrap();
        assert_eq!(unit.mime_type(), "audio/wav");
        let (samples, rate) = decode_wav_mono(unit.bytes()).unwrap();
        assert_eq!(rate, 48_000);
        assert_eq!(samples.len(), 480);
    }

    #[test]
    fn test_empty_capture_is_a_recording_error() {
        let captured = CapturedAudio::Encoded {
            chunks: vec![],
            mime_type: "audio/webm".to_string(),
        };
        assert_eq!(captured.into_audio_unit().unwrap_err().kind_name(), "recording");
    }
}
