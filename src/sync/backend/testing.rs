//! Test doubles: a backend whose calls can be held open and a fake microphone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::{Backend, BackendFuture, InMemoryBackend};
use crate::sync::attachment::device::{
    CaptureSession, DeviceFuture, Microphone, RecordedAudio, encode_wav,
};
use crate::sync::core::errors::{BackendError, BackendResult, DeviceError};
use crate::sync::core::ids::{ConversationId, UserId};
use crate::sync::core::model::{BlobUpload, Conversation, Message, NewMessage, Profile};

/// Call that can be held open.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum GateKey {
    /// `list_messages` for one conversation.
    ListMessages(ConversationId),
    /// `list_conversations` for one owner.
    ListConversations(UserId),
    /// `create_message` with this exact content.
    CreateMessage(String),
    /// `get_profile` for one identity.
    GetProfile(UserId),
    /// Next `upload_blob`.
    UploadBlob,
    /// `list_messages` for one conversation, held after the rows were read.
    ListMessagesAnswered(ConversationId),
}

/// One-shot gate handed to the test.
#[derive(Default)]
pub(crate) struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until the gated call has reached the backend.
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the gated call proceed.
    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

/// In-memory backend whose calls can be paused until released.
#[derive(Default)]
pub(crate) struct GatedBackend {
    inner: InMemoryBackend,
    gates: Mutex<HashMap<GateKey, Arc<Gate>>>,
    profile_conflict: AtomicBool,
}

impl GatedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) const fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    /// Hold the next call matching `key`.
    pub(crate) fn hold(&self, key: GateKey) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().insert(key, Arc::clone(&gate));
        gate
    }

    /// Answer every `create_profile` with a conflict without storing anything.
    pub(crate) fn conflict_on_create_profile(&self) {
        self.profile_conflict.store(true, Ordering::SeqCst);
    }

    async fn pass(&self, key: GateKey) {
        let gate = self.gates.lock().unwrap().remove(&key);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }
}

impl Backend for GatedBackend {
    fn get_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Option<Profile>>> {
        Box::pin(async move {
            self.pass(GateKey::GetProfile(id)).await;
            self.inner.get_profile(id).await
        })
    }

    fn create_profile(&self, id: UserId) -> BackendFuture<'_, BackendResult<Profile>> {
        if self.profile_conflict.load(Ordering::SeqCst) {
            return Box::pin(async move { Err(BackendError::Conflict(format!("profile {id}"))) });
        }
        self.inner.create_profile(id)
    }

    fn list_conversations(
        &self,
        owner: UserId,
    ) -> BackendFuture<'_, BackendResult<Vec<Conversation>>> {
        Box::pin(async move {
            self.pass(GateKey::ListConversations(owner)).await;
            self.inner.list_conversations(owner).await
        })
    }

    fn create_conversation(
        &self,
        owner: UserId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>> {
        self.inner.create_conversation(owner, title)
    }

    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> BackendFuture<'_, BackendResult<Conversation>> {
        self.inner.rename_conversation(id, title)
    }

    fn delete_conversation(&self, id: ConversationId) -> BackendFuture<'_, BackendResult<()>> {
        self.inner.delete_conversation(id)
    }

    fn list_messages(
        &self,
        conversation: ConversationId,
    ) -> BackendFuture<'_, BackendResult<Vec<Message>>> {
        Box::pin(async move {
            self.pass(GateKey::ListMessages(conversation)).await;
            let rows = self.inner.list_messages(conversation).await;
            self.pass(GateKey::ListMessagesAnswered(conversation)).await;
            rows
        })
    }

    fn create_message(&self, message: NewMessage) -> BackendFuture<'_, BackendResult<Message>> {
        Box::pin(async move {
            self.pass(GateKey::CreateMessage(message.content.clone())).await;
            self.inner.create_message(message).await
        })
    }

    fn upload_blob(&self, upload: BlobUpload) -> BackendFuture<'_, BackendResult<String>> {
        Box::pin(async move {
            self.pass(GateKey::UploadBlob).await;
            self.inner.upload_blob(upload).await
        })
    }
}

/// Microphone double counting device acquisitions and releases.
#[derive(Default)]
pub(crate) struct FakeMicrophone {
    deny: AtomicBool,
    fail_finish: AtomicBool,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn denying() -> Self {
        let mic = Self::default();
        mic.deny.store(true, Ordering::SeqCst);
        mic
    }

    pub(crate) fn fail_finish(&self) {
        self.fail_finish.store(true, Ordering::SeqCst);
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Sessions acquired and not yet released.
    pub(crate) fn held(&self) -> usize {
        self.acquired() - self.released()
    }
}

impl Microphone for FakeMicrophone {
    fn acquire(&self) -> DeviceFuture<'_, Result<Box<dyn CaptureSession>, DeviceError>> {
        Box::pin(async move {
            if self.deny.load(Ordering::SeqCst) {
                return Err(DeviceError::PermissionDenied);
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            let session: Box<dyn CaptureSession> = Box::new(FakeCapture {
                fail: self.fail_finish.load(Ordering::SeqCst),
                released: Arc::clone(&self.released),
            });
            Ok(session)
        })
    }
}

struct FakeCapture {
    fail: bool,
    released: Arc<AtomicUsize>,
}

impl CaptureSession for FakeCapture {
    fn finish(self: Box<Self>) -> DeviceFuture<'static, Result<RecordedAudio, DeviceError>> {
        Box::pin(async move {
            if self.fail {
                return Err(DeviceError::Capture("stream closed".to_string()));
            }
            Ok(RecordedAudio::wav(encode_wav(&[0, 512, -512, 0], 16_000, 1)))
        })
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
