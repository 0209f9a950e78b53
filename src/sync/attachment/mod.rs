//! Attachment capture and upload.

#[cfg(feature = "cpal_mic")]
pub mod cpal_mic;
pub mod device;
pub mod pipeline;

#[cfg(feature = "cpal_mic")]
pub use cpal_mic::CpalMicrophone;
pub use device::{
    CaptureSession, DeviceFuture, Microphone, NoMicrophone, RecordedAudio, encode_wav,
};
pub use pipeline::{AttachmentPipeline, PipelineState};
