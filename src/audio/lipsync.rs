//! Two-stage lip-sync.
//!
//! Stage 1 ([`MotionExtractor`]) turns synthesized audio into motion curves.
//! Stage 2 ([`SceneConverter`]) turns audio plus motion into something the
//! renderer can play. In bridged mode stage 1 runs on the background side and
//! the curves cross the bridge in the binary layout below; stage 2 always
//! runs where the renderer lives. Either stage failing leaves plain audio.
//!
//! Binary layout (little-endian):
//! `"MOTN" | u32 version | f32 fps | u32 curve_count |
//!  { u32 name_len | name (UTF-8) | u32 value_count | f32 * value_count }*`

use super::{decode_wav_mono, extension_for_mime, AudioUnit, WireBinary};
use crate::error::AssistantError;
use async_trait::async_trait;
use std::time::Duration;

pub const MOTION_MIME_TYPE: &str = "application/x-motion-curves";
pub const DEFAULT_MOTION_FPS: u32 = 30;
pub const MOUTH_OPEN_CURVE: &str = "mouth_open";

const MAGIC: &[u8; 4] = b"MOTN";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct MotionCurve {
    pub name: String,
    pub values: Vec<f32>,
}

/// Named per-frame animation curves.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionData {
    pub fps: f32,
    pub curves: Vec<MotionCurve>,
}

impl MotionData {
    pub fn curve(&self, name: &str) -> Option<&MotionCurve> {
        self.curves.iter().find(|c| c.name == name)
    }

    pub fn frame_count(&self) -> usize {
        self.curves.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    pub fn duration(&self) -> Duration {
        if self.fps <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f32(self.frame_count() as f32 / self.fps)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.frame_count() * 4 * self.curves.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.fps.to_le_bytes());
        out.extend_from_slice(&(self.curves.len() as u32).to_le_bytes());
        for curve in &self.curves {
            out.extend_from_slice(&(curve.name.len() as u32).to_le_bytes());
            out.extend_from_slice(curve.name.as_bytes());
            out.extend_from_slice(&(curve.values.len() as u32).to_le_bytes());
            for v in &curve.values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AssistantError> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(4)? != MAGIC {
            return Err(AssistantError::protocol("motion data: bad magic"));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(AssistantError::protocol(format!(
                "motion data: unsupported version {}",
                version
            )));
        }
        let fps = reader.f32()?;
        let count = reader.u32()? as usize;

        let mut curves = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name_len = reader.u32()? as usize;
            let name = String::from_utf8(reader.take(name_len)?.to_vec())
                .map_err(|_| AssistantError::protocol("motion data: curve name is not UTF-8"))?;
            let n = reader.u32()? as usize;
            let mut values = Vec::with_capacity(n.min(reader.remaining() / 4));
            for _ in 0..n {
                values.push(reader.f32()?);
            }
            curves.push(MotionCurve { name, values });
        }
        Ok(Self { fps, curves })
    }

    pub fn to_wire(&self) -> WireBinary {
        WireBinary::new(self.encode(), MOTION_MIME_TYPE)
    }

    pub fn from_wire(wire: &WireBinary) -> Result<Self, AssistantError> {
        if wire.mime_type != MOTION_MIME_TYPE {
            return Err(AssistantError::protocol(format!(
                "expected {}, got {}",
                MOTION_MIME_TYPE, wire.mime_type
            )));
        }
        Self::decode(&wire.bytes)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AssistantError> {
        if self.remaining() < n {
            return Err(AssistantError::protocol("motion data: truncated"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array4(&mut self) -> Result<[u8; 4], AssistantError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32, AssistantError> {
        Ok(u32::from_le_bytes(self.array4()?))
    }

    fn f32(&mut self) -> Result<f32, AssistantError> {
        Ok(f32::from_le_bytes(self.array4()?))
    }
}

/// Stage 1: derive motion curves from audio.
pub trait MotionExtractor: Send + Sync {
    fn extract(&self, audio: &AudioUnit) -> Result<MotionData, AssistantError>;
}

/// Mouth-open curve from the RMS envelope of WAV audio.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeMotionExtractor {
    pub fps: u32,
    /// RMS is multiplied by this before clamping to `0.0..=1.0`.
    pub gain: f32,
}

impl Default for EnvelopeMotionExtractor {
    fn default() -> Self {
        Self {
            fps: DEFAULT_MOTION_FPS,
            gain: 4.0,
        }
    }
}

impl MotionExtractor for EnvelopeMotionExtractor {
    fn extract(&self, audio: &AudioUnit) -> Result<MotionData, AssistantError> {
        if extension_for_mime(audio.mime_type()) != "wav" {
            return Err(AssistantError::provider(format!(
                "lip-sync needs WAV audio, got {}",
                audio.mime_type()
            )));
        }
        let (samples, sample_rate) = decode_wav_mono(audio.bytes())
            .map_err(|e| AssistantError::provider(format!("lip-sync could not read audio: {}", e)))?;

        let fps = self.fps.max(1);
        let window = (sample_rate / fps).max(1) as usize;
        let values = samples
            .chunks(window)
            .map(|frame| {
                let energy = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
                (energy.sqrt() * self.gain).clamp(0.0, 1.0)
            })
            .collect();

        Ok(MotionData {
            fps: fps as f32,
            curves: vec![MotionCurve {
                name: MOUTH_OPEN_CURVE.to_string(),
                values,
            }],
        })
    }
}

/// A renderer-ready clip produced by stage 2.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneClip {
    pub format: String,
    pub bytes: Vec<u8>,
    pub duration: Duration,
}

/// Stage 2: turn audio plus motion into a scene clip for the renderer.
#[async_trait]
pub trait SceneConverter: Send + Sync {
    async fn convert(&self, audio: &AudioUnit, motion: &MotionData) -> Result<SceneClip, AssistantError>;
}
