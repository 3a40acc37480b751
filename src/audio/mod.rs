//! Audio pipeline: capture → transcription, and text → chunked synthesis →
//! ordered playback with optional lip-sync.
//!
//! Binary audio never crosses the context boundary as-is. An [`AudioUnit`]
//! is flattened into a [`WireBinary`] (byte array plus MIME type) for
//! transport and rebuilt on arrival; the flattened form is never stored.

pub mod chunker;
pub mod lipsync;
pub mod playback;
pub mod recorder;
#[cfg(feature = "rodio-playback")]
mod rodio_output;
pub mod speech;

pub use chunker::{split_for_speech, ChunkLimits};
pub use lipsync::{EnvelopeMotionExtractor, MotionData, MotionExtractor, SceneClip, SceneConverter};
pub use playback::{AudioOutput, PlaybackItem, PlaybackQueue, SpeechSessionId};
pub use recorder::{CaptureSession, CapturedAudio, MicrophoneDevice, Recorder, RecorderState, RecordingCallbacks};
#[cfg(feature = "rodio-playback")]
pub use rodio_output::RodioOutput;
pub use speech::{SpeakOptions, SpeakReport, SpeechPipeline};

use crate::error::AssistantError;
use crate::lock;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A binary audio buffer with its MIME type.
///
/// Deliberately not `Serialize`: use [`AudioUnit::to_wire`] to cross a
/// context boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioUnit {
    bytes: Vec<u8>,
    mime_type: String,
}

impl AudioUnit {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension matching the MIME type (used for multipart uploads).
    pub fn file_extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }

    pub fn to_wire(&self) -> WireBinary {
        WireBinary::new(self.bytes.clone(), self.mime_type.clone())
    }

    pub fn from_wire(wire: WireBinary) -> Self {
        Self {
            bytes: wire.bytes,
            mime_type: wire.mime_type,
        }
    }
}

/// Transport form of a binary buffer: a plain byte array plus MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBinary {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl WireBinary {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let base = mime.split(';').next().unwrap_or("").trim();
    match base {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/flac" => "flac",
        _ => "bin",
    }
}

/// Encode interleaved f32 samples as 16-bit PCM WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>, AssistantError> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| AssistantError::recording(format!("WAV encoding failed: {}", e)))?;
        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| AssistantError::recording(format!("WAV encoding failed: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| AssistantError::recording(format!("WAV encoding failed: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV buffer into mono f32 samples and its sample rate.
pub fn decode_wav_mono(bytes: &[u8]) -> Result<(Vec<f32>, u32), hound::Error> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Coordinates switching the audio device from capture to playback.
///
/// Some platforms need a short pause after the microphone is released
/// before the same device can play audio.
#[derive(Debug)]
pub struct DeviceHandoff {
    settle_delay: Duration,
    released_at: Mutex<Option<Instant>>,
}

impl DeviceHandoff {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            released_at: Mutex::new(None),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Record that the capture device was just released.
    pub fn mark_released(&self) {
        *lock(&self.released_at) = Some(Instant::now());
    }

    /// Wait until the settle delay since the last release has elapsed.
    pub async fn wait_settled(&self) {
        let released = *lock(&self.released_at);
        if let Some(at) = released {
            let ready_at = at + self.settle_delay;
            if ready_at > Instant::now() {
                log::debug!("Audio: waiting for device settle delay");
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }
}

impl Default for DeviceHandoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::config::DEFAULT_SETTLE_DELAY_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip_preserves_bytes_and_mime() {
        let unit = AudioUnit::new(vec![0, 1, 2, 255], "audio/webm;codecs=opus");
        let json = serde_json::to_string(&unit.to_wire()).unwrap();
        assert!(json.contains("[0,1,2,255]"));

        let back = AudioUnit::from_wire(serde_json::from_str(&json).unwrap());
        assert_eq!(back, unit);
        assert_eq!(back.file_extension(), "webm");
    }

    #[test]
    fn test_wav_encode_decode() {
        let samples: Vec<f32> = (0..1600).map(|i| ((i as f32) / 50.0).sin() * 0.5).collect();
        let wav = encode_wav(&samples, 16_000, 1).unwrap();
        assert_eq!(&wav[..4], b"RIFF");

        let (decoded, rate) = decode_wav_mono(&wav).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(decoded.len(), samples.len());
        assert!((decoded[100] - samples[100]).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_handoff_waits_for_settle_delay() {
        let handoff = DeviceHandoff::new(Duration::from_millis(300));
        let start = Instant::now();
        handoff.wait_settled().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        handoff.mark_released();
        handoff.wait_settled().await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
