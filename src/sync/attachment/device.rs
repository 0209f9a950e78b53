//! Capture device seam and WAV container finalization.

use std::future::Future;
use std::pin::Pin;

use crate::sync::core::errors::DeviceError;

/// Boxed future type for device operations.
pub type DeviceFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Finalized audio ready for upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedAudio {
    /// Container bytes.
    pub bytes: Vec<u8>,
    /// MIME type of the container.
    pub content_type: String,
    /// File extension matching the container.
    pub extension: String,
}

impl RecordedAudio {
    /// Wrap finished WAV bytes.
    #[must_use]
    pub fn wav(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: "audio/wav".to_string(),
            extension: "wav".to_string(),
        }
    }
}

/// Source of exclusive capture sessions.
pub trait Microphone: Send + Sync {
    /// Acquire the device and start recording.
    ///
    /// # Errors
    /// Returns [`DeviceError::PermissionDenied`] or [`DeviceError::Unavailable`]
    /// if the device cannot be opened.
    fn acquire(&self) -> DeviceFuture<'_, Result<Box<dyn CaptureSession>, DeviceError>>;
}

/// A running capture. Dropping it releases the device.
pub trait CaptureSession: Send {
    /// Stop recording, release the device and return the finalized container.
    ///
    /// # Errors
    /// Returns [`DeviceError::Capture`] if the recording cannot be finalized.
    fn finish(self: Box<Self>) -> DeviceFuture<'static, Result<RecordedAudio, DeviceError>>;
}

/// Microphone for hosts without a capture device.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMicrophone;

impl Microphone for NoMicrophone {
    fn acquire(&self) -> DeviceFuture<'_, Result<Box<dyn CaptureSession>, DeviceError>> {
        Box::pin(async {
            Err(DeviceError::Unavailable(
                "no capture device configured".to_string(),
            ))
        })
    }
}

const WAV_HEADER_LEN: u32 = 44;
const BITS_PER_SAMPLE: u16 = 16;

/// Wrap interleaved 16-bit PCM samples in a WAV container.
#[must_use]
pub fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let block_align = channels.saturating_mul(BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate.saturating_mul(u32::from(block_align));
    let data_len = u32::try_from(samples.len().saturating_mul(2)).unwrap_or(u32::MAX);

    let mut out = Vec::with_capacity(WAV_HEADER_LEN as usize + samples.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&data_len.saturating_add(WAV_HEADER_LEN - 8).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
