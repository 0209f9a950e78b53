//! Capture-and-upload pipeline producing message attachments.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::device::{CaptureSession, Microphone};
use crate::sync::backend::Backend;
use crate::sync::core::config::AttachmentConfig;
use crate::sync::core::errors::{SyncError, SyncResult};
use crate::sync::core::ids::UserId;
use crate::sync::core::model::{Attachment, AttachmentKind, BlobUpload};

/// Observable pipeline state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum PipelineState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// The microphone is recording.
    Capturing,
    /// The recording is being finalized.
    Encoding,
    /// The blob is being uploaded.
    Uploading,
    /// An attachment is ready to be sent.
    Ready(Attachment),
}

impl PipelineState {
    /// Whether an attachment is in flight.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Capturing | Self::Encoding | Self::Uploading)
    }
}

#[derive(Default)]
struct Inner {
    state: PipelineState,
    capture: Option<Box<dyn CaptureSession>>,
    last_error: Option<String>,
    epoch: u64,
}

/// Captures audio or takes a file, uploads it and yields an [`Attachment`].
///
/// At most one attachment is in flight; starting another returns
/// [`SyncError::Busy`]. Failures return the pipeline to [`PipelineState::Idle`]
/// and keep the error message for display.
pub struct AttachmentPipeline {
    owner: UserId,
    backend: Arc<dyn Backend>,
    microphone: Arc<dyn Microphone>,
    config: AttachmentConfig,
    inner: Mutex<Inner>,
}

impl AttachmentPipeline {
    /// Create an idle pipeline uploading on behalf of `owner`.
    #[must_use]
    pub fn new(
        owner: UserId,
        backend: Arc<dyn Backend>,
        microphone: Arc<dyn Microphone>,
        config: AttachmentConfig,
    ) -> Self {
        Self {
            owner,
            backend,
            microphone,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Current state.
    pub async fn state(&self) -> PipelineState {
        self.inner.lock().await.state.clone()
    }

    /// Message of the last failure, if the pipeline has not succeeded since.
    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Take the ready attachment, returning the pipeline to idle.
    pub async fn take_ready(&self) -> Option<Attachment> {
        let mut inner = self.inner.lock().await;
        match std::mem::take(&mut inner.state) {
            PipelineState::Ready(attachment) => Some(attachment),
            other => {
                inner.state = other;
                None
            }
        }
    }

    /// Acquire the microphone and start recording.
    ///
    /// # Errors
    /// Returns [`SyncError::Busy`] if an attachment is in flight, or
    /// [`SyncError::Device`] if the microphone cannot be acquired.
    pub async fn start_capture(&self) -> SyncResult<()> {
        let epoch = self.begin(PipelineState::Capturing).await?;

        let session = match self.microphone.acquire().await {
            Ok(session) => session,
            Err(err) => return Err(self.fail(epoch, err.into()).await),
        };

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            debug!("Capture acquired after teardown, releasing device");
            return Ok(());
        }
        inner.capture = Some(session);
        info!("Audio capture started");
        Ok(())
    }

    /// Stop recording, finalize the audio and upload it.
    ///
    /// # Errors
    /// Returns [`SyncError::NotCapturing`] if nothing is recording, or the
    /// device or backend error that ended the attempt.
    pub async fn stop_capture(&self) -> SyncResult<Attachment> {
        let (session, epoch) = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.capture.take() else {
                return Err(SyncError::NotCapturing);
            };
            inner.state = PipelineState::Encoding;
            (session, inner.epoch)
        };

        let audio = match session.finish().await {
            Ok(audio) => audio,
            Err(err) => return Err(self.fail(epoch, err.into()).await),
        };
        debug!(bytes = audio.bytes.len(), "Recording finalized");

        self.advance(epoch, PipelineState::Uploading).await;
        let upload = BlobUpload {
            owner: self.owner,
            bytes: audio.bytes,
            kind: AttachmentKind::Audio,
            content_type: audio.content_type,
            file_name: format!("recording.{}", audio.extension),
        };
        self.upload(epoch, upload, self.config.audio_display_name.clone())
            .await
    }

    /// Upload a user-selected file.
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidAttachment`] for empty or oversized files,
    /// [`SyncError::Busy`] if an attachment is in flight, or the backend error.
    pub async fn attach_file(
        &self,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> SyncResult<Attachment> {
        self.check_size(name, bytes.len())?;
        let epoch = self.begin(PipelineState::Uploading).await?;
        let upload = BlobUpload {
            owner: self.owner,
            bytes,
            kind: AttachmentKind::File,
            content_type: content_type.to_string(),
            file_name: name.to_string(),
        };
        self.upload(epoch, upload, name.to_string()).await
    }

    /// Read a file from disk and upload it, guessing its content type.
    ///
    /// # Errors
    /// Returns [`SyncError::Io`] if the file cannot be read, otherwise as
    /// [`Self::attach_file`].
    pub async fn attach_path(&self, path: impl AsRef<Path>) -> SyncResult<Attachment> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::InvalidAttachment(format!("{} has no file name", path.display())))?;
        let bytes = tokio::fs::read(path).await?;
        let content_type = mime_guess::from_path(path).first_or_octet_stream();
        self.attach_file(&name, bytes, content_type.essence_str())
            .await
    }

    /// Release the microphone and drop any in-flight result.
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        inner.capture = None;
        inner.state = PipelineState::Idle;
        inner.last_error = None;
        inner.epoch += 1;
        debug!("Attachment pipeline torn down");
    }

    fn check_size(&self, name: &str, len: usize) -> SyncResult<()> {
        if len == 0 {
            return Err(SyncError::InvalidAttachment(format!("{name} is empty")));
        }
        if len > self.config.max_upload_bytes {
            return Err(SyncError::InvalidAttachment(format!(
                "{name} is {len} bytes, limit is {}",
                self.config.max_upload_bytes
            )));
        }
        Ok(())
    }

    /// Reserve the pipeline for a new attachment.
    async fn begin(&self, next: PipelineState) -> SyncResult<u64> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_busy() {
            debug!(state = ?inner.state, "Attachment rejected, pipeline busy");
            return Err(SyncError::Busy);
        }
        inner.state = next;
        inner.last_error = None;
        Ok(inner.epoch)
    }

    async fn advance(&self, epoch: u64, next: PipelineState) {
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            inner.state = next;
        }
    }

    async fn upload(&self, epoch: u64, upload: BlobUpload, name: String) -> SyncResult<Attachment> {
        if let Err(err) = self.check_size(&name, upload.bytes.len()) {
            return Err(self.fail(epoch, err).await);
        }
        let kind = upload.kind;
        let url = match self.backend.upload_blob(upload).await {
            Ok(url) => url,
            Err(err) => return Err(self.fail(epoch, err.into()).await),
        };

        let attachment = Attachment { url, kind, name };
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            inner.state = PipelineState::Ready(attachment.clone());
            info!(kind = %attachment.kind, url = %attachment.url, "Attachment ready");
        } else {
            debug!(url = %attachment.url, "Upload finished after teardown, not kept");
        }
        Ok(attachment)
    }

    /// Record a failure and return to idle; the device is released if held.
    async fn fail(&self, epoch: u64, err: SyncError) -> SyncError {
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            inner.capture = None;
            inner.state = PipelineState::Idle;
            inner.last_error = Some(err.to_string());
        }
        warn!(error = %err, "Attachment failed");
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sync::backend::testing::{FakeMicrophone, GateKey, GatedBackend};
    use crate::sync::backend::{BackendOp, InMemoryBackend};
    use crate::sync::core::errors::{BackendError, DeviceError};

    fn pipeline(backend: Arc<dyn Backend>, microphone: Arc<FakeMicrophone>) -> AttachmentPipeline {
        AttachmentPipeline::new(UserId::new(), backend, microphone, AttachmentConfig::default())
    }

    #[tokio::test]
    async fn test_file_upload_becomes_ready() {
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = pipeline(backend.clone(), Arc::new(FakeMicrophone::new()));

        let attachment = pipeline
            .attach_file("notes.txt", b"hello".to_vec(), "text/plain")
            .await
            .unwrap();
        assert_eq!(attachment.kind, AttachmentKind::File);
        assert_eq!(attachment.name, "notes.txt");
        assert_eq!(backend.blob(&attachment.url), Some(b"hello".to_vec()));
        assert_eq!(pipeline.state().await, PipelineState::Ready(attachment.clone()));

        assert_eq!(pipeline.take_ready().await, Some(attachment));
        assert_eq!(pipeline.state().await, PipelineState::Idle);
        assert_eq!(pipeline.take_ready().await, None);
    }

    #[tokio::test]
    async fn test_busy_while_uploading_keeps_in_flight_result() {
        let backend = Arc::new(GatedBackend::new());
        let microphone = Arc::new(FakeMicrophone::new());
        let pipeline = Arc::new(pipeline(backend.clone(), microphone.clone()));
        let gate = backend.hold(GateKey::UploadBlob);

        let first = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move {
                pipeline
                    .attach_file("a.txt", b"first".to_vec(), "text/plain")
                    .await
            }
        });
        gate.entered().await;
        assert_eq!(pipeline.state().await, PipelineState::Uploading);

        let second = pipeline
            .attach_file("b.txt", b"second".to_vec(), "text/plain")
            .await;
        assert!(matches!(second, Err(SyncError::Busy)));
        assert!(matches!(pipeline.start_capture().await, Err(SyncError::Busy)));
        assert_eq!(microphone.acquired(), 0);

        gate.release();
        let attachment = first.await.unwrap().unwrap();
        assert_eq!(attachment.name, "a.txt");
        assert_eq!(backend.inner().blob(&attachment.url), Some(b"first".to_vec()));
        assert_eq!(pipeline.state().await, PipelineState::Ready(attachment));
    }

    #[tokio::test]
    async fn test_capture_round_trip_releases_microphone() {
        let backend = Arc::new(InMemoryBackend::new());
        let microphone = Arc::new(FakeMicrophone::new());
        let pipeline = pipeline(backend.clone(), microphone.clone());

        pipeline.start_capture().await.unwrap();
        assert_eq!(pipeline.state().await, PipelineState::Capturing);
        assert_eq!(microphone.held(), 1);

        let attachment = pipeline.stop_capture().await.unwrap();
        assert_eq!(attachment.kind, AttachmentKind::Audio);
        assert_eq!(attachment.name, "Voice recording");
        assert!(attachment.url.ends_with(".wav"));
        let blob = backend.blob(&attachment.url).unwrap();
        assert_eq!(&blob[0..4], b"RIFF");
        assert_eq!(microphone.held(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_returns_to_idle() {
        let microphone = Arc::new(FakeMicrophone::denying());
        let pipeline = pipeline(Arc::new(InMemoryBackend::new()), microphone.clone());

        let result = pipeline.start_capture().await;
        assert!(matches!(
            result,
            Err(SyncError::Device(DeviceError::PermissionDenied))
        ));
        assert_eq!(pipeline.state().await, PipelineState::Idle);
        assert!(pipeline.last_error().await.is_some());
        assert_eq!(microphone.acquired(), 0);

        // The pipeline is usable again.
        pipeline
            .attach_file("a.txt", b"x".to_vec(), "text/plain")
            .await
            .unwrap();
        assert_eq!(pipeline.last_error().await, None);
    }

    #[tokio::test]
    async fn test_upload_failure_preserves_error_and_releases_device() {
        let backend = Arc::new(InMemoryBackend::new());
        let microphone = Arc::new(FakeMicrophone::new());
        let pipeline = pipeline(backend.clone(), microphone.clone());
        backend.fail_next(BackendOp::UploadBlob, "storage quota exceeded");

        pipeline.start_capture().await.unwrap();
        let result = pipeline.stop_capture().await;
        assert!(matches!(
            result,
            Err(SyncError::Backend(BackendError::Injected(_)))
        ));
        assert_eq!(pipeline.state().await, PipelineState::Idle);
        assert!(
            pipeline
                .last_error()
                .await
                .unwrap()
                .contains("storage quota exceeded")
        );
        assert_eq!(microphone.held(), 0);
    }

    #[tokio::test]
    async fn test_finalize_failure_returns_to_idle() {
        let microphone = Arc::new(FakeMicrophone::new());
        microphone.fail_finish();
        let pipeline = pipeline(Arc::new(InMemoryBackend::new()), microphone.clone());

        pipeline.start_capture().await.unwrap();
        let result = pipeline.stop_capture().await;
        assert!(matches!(result, Err(SyncError::Device(DeviceError::Capture(_)))));
        assert_eq!(pipeline.state().await, PipelineState::Idle);
        assert_eq!(microphone.held(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_capture() {
        let pipeline = pipeline(Arc::new(InMemoryBackend::new()), Arc::new(FakeMicrophone::new()));
        assert!(matches!(
            pipeline.stop_capture().await,
            Err(SyncError::NotCapturing)
        ));
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_teardown_releases_microphone() {
        let microphone = Arc::new(FakeMicrophone::new());
        let pipeline = pipeline(Arc::new(InMemoryBackend::new()), microphone.clone());

        pipeline.start_capture().await.unwrap();
        assert_eq!(microphone.held(), 1);
        pipeline.teardown().await;
        assert_eq!(microphone.held(), 0);
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_upload_after_teardown_is_not_kept() {
        let backend = Arc::new(GatedBackend::new());
        let pipeline = Arc::new(pipeline(backend.clone(), Arc::new(FakeMicrophone::new())));
        let gate = backend.hold(GateKey::UploadBlob);

        let upload = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.attach_file("a.txt", b"a".to_vec(), "text/plain").await }
        });
        gate.entered().await;
        pipeline.teardown().await;
        gate.release();

        upload.await.unwrap().unwrap();
        assert_eq!(pipeline.state().await, PipelineState::Idle);
        assert_eq!(pipeline.take_ready().await, None);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized_files() {
        let config = AttachmentConfig {
            max_upload_bytes: 4,
            ..AttachmentConfig::default()
        };
        let pipeline = AttachmentPipeline::new(
            UserId::new(),
            Arc::new(InMemoryBackend::new()),
            Arc::new(FakeMicrophone::new()),
            config,
        );
        assert!(matches!(
            pipeline.attach_file("e.txt", Vec::new(), "text/plain").await,
            Err(SyncError::InvalidAttachment(_))
        ));
        assert!(matches!(
            pipeline.attach_file("big.bin", vec![0; 5], "application/octet-stream").await,
            Err(SyncError::InvalidAttachment(_))
        ));
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_attach_path_guesses_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        tokio::fs::write(&path, [0x89, b'P', b'N', b'G']).await.unwrap();

        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = pipeline(backend.clone(), Arc::new(FakeMicrophone::new()));
        let attachment = tokio::time::timeout(Duration::from_secs(5), pipeline.attach_path(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attachment.name, "photo.png");
        assert!(attachment.url.ends_with(".png"));

        let missing = pipeline.attach_path(dir.path().join("missing.txt")).await;
        assert!(matches!(missing, Err(SyncError::Io(_))));
    }
}
