//! Identity lifecycle driving the conversation store and attachment pipeline.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sync::attachment::{AttachmentPipeline, Microphone};
use crate::sync::backend::Backend;
use crate::sync::conversation::ConversationStore;
use crate::sync::core::config::AttachmentConfig;
use crate::sync::core::errors::{BackendError, SyncResult};
use crate::sync::core::ids::UserId;
use crate::sync::core::model::Profile;
use crate::sync::reply::ReplyGenerator;

/// Make sure `user` has a profile, creating an empty one if absent.
///
/// Calling it again for the same identity returns the existing profile.
///
/// # Errors
/// Returns the backend error if the profile can be neither read nor created.
pub async fn ensure_profile(backend: &dyn Backend, user: UserId) -> SyncResult<Profile> {
    if let Some(profile) = backend.get_profile(user).await? {
        return Ok(profile);
    }
    match backend.create_profile(user).await {
        Ok(profile) => {
            info!(%user, "Profile created");
            Ok(profile)
        }
        // Another client created it between our read and write.
        Err(BackendError::Conflict(_)) => backend
            .get_profile(user)
            .await?
            .ok_or_else(|| BackendError::Missing(format!("profile {user}")).into()),
        Err(err) => Err(err.into()),
    }
}

#[derive(Default)]
struct Binding {
    identity: Option<UserId>,
    store: Option<Arc<ConversationStore>>,
    attachments: Option<Arc<AttachmentPipeline>>,
    generation: u64,
}

impl Binding {
    /// Clear the store and tear the pipeline down so late results are dropped.
    async fn release(&mut self) {
        if let Some(store) = self.store.take() {
            store.clear().await;
        }
        if let Some(attachments) = self.attachments.take() {
            attachments.teardown().await;
        }
    }
}

/// Builds a [`ConversationStore`] and an [`AttachmentPipeline`] when an
/// identity signs in and tears both down when the identity signs out.
pub struct SessionBinding {
    backend: Arc<dyn Backend>,
    reply: Arc<dyn ReplyGenerator>,
    microphone: Arc<dyn Microphone>,
    attachment_config: AttachmentConfig,
    inner: Mutex<Binding>,
}

impl SessionBinding {
    /// Create a signed-out binding.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        reply: Arc<dyn ReplyGenerator>,
        microphone: Arc<dyn Microphone>,
        attachment_config: AttachmentConfig,
    ) -> Self {
        Self {
            backend,
            reply,
            microphone,
            attachment_config,
            inner: Mutex::new(Binding::default()),
        }
    }

    /// Signed-in identity, if any.
    pub async fn identity(&self) -> Option<UserId> {
        self.inner.lock().await.identity
    }

    /// Store of the signed-in identity.
    pub async fn store(&self) -> Option<Arc<ConversationStore>> {
        self.inner.lock().await.store.clone()
    }

    /// Attachment pipeline of the signed-in identity.
    pub async fn attachments(&self) -> Option<Arc<AttachmentPipeline>> {
        self.inner.lock().await.attachments.clone()
    }

    /// Apply an identity transition.
    ///
    /// Signing in again with the current identity is a no-op; switching
    /// identity signs the previous one out first.
    ///
    /// # Errors
    /// Returns the sign-in error, if any.
    pub async fn on_identity_change(&self, identity: Option<UserId>) -> SyncResult<()> {
        let current = self.identity().await;
        match identity {
            Some(user) if current == Some(user) => {
                debug!(%user, "Identity unchanged");
                Ok(())
            }
            Some(user) => {
                if current.is_some() {
                    self.sign_out().await;
                }
                self.sign_in(user).await
            }
            None => {
                self.sign_out().await;
                Ok(())
            }
        }
    }

    /// Ensure a profile, build a fresh store and fetch its conversations.
    ///
    /// # Errors
    /// Returns the profile or fetch error. A failed fetch still leaves the
    /// (empty) store installed.
    pub async fn sign_in(&self, user: UserId) -> SyncResult<()> {
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.identity = Some(user);
            inner.release().await;
            inner.generation
        };
        info!(%user, "Signing in");

        if let Err(err) = ensure_profile(self.backend.as_ref(), user).await {
            warn!(%user, error = %err, "Failed to ensure profile");
            let mut inner = self.inner.lock().await;
            if inner.generation == generation {
                inner.identity = None;
            }
            return Err(err);
        }

        let store = Arc::new(ConversationStore::new(
            user,
            Arc::clone(&self.backend),
            Arc::clone(&self.reply),
        ));
        let attachments = Arc::new(AttachmentPipeline::new(
            user,
            Arc::clone(&self.backend),
            Arc::clone(&self.microphone),
            self.attachment_config.clone(),
        ));
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                debug!(%user, "Sign-in superseded, store not installed");
                return Ok(());
            }
            inner.store = Some(Arc::clone(&store));
            inner.attachments = Some(attachments);
        }

        store.fetch_all().await?;
        Ok(())
    }

    /// Clear and drop the store and release the microphone. Calls still in
    /// flight are not cancelled but their results are not applied.
    pub async fn sign_out(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        let user = inner.identity.take();
        inner.release().await;
        if let Some(user) = user {
            info!(%user, "Signed out");
        }
    }

    /// Follow identity changes published on `identity` until the sender is
    /// dropped or [`SessionTask::shutdown`] is called.
    #[must_use]
    pub fn spawn(self: Arc<Self>, mut identity: watch::Receiver<Option<UserId>>) -> SessionTask {
        let shutdown = Arc::new(Notify::new());
        let notified = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            info!("Session binding started");
            let initial = *identity.borrow_and_update();
            if let Err(err) = self.on_identity_change(initial).await {
                warn!(error = %err, "Initial identity transition failed");
            }
            loop {
                tokio::select! {
                    changed = identity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = *identity.borrow_and_update();
                        if let Err(err) = self.on_identity_change(next).await {
                            warn!(error = %err, "Identity transition failed");
                        }
                    }
                    () = notified.notified() => break,
                }
            }
            info!("Session binding stopped");
        });
        SessionTask { handle, shutdown }
    }
}

/// Handle of a spawned [`SessionBinding`] task.
pub struct SessionTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl SessionTask {
    /// Stop following identity changes and wait for the task to end.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "Session binding task failed");
        }
    }

    /// Wait for the task to end on its own.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            warn!(error = %err, "Session binding task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sync::core::errors::SyncError;
    use crate::sync::attachment::PipelineState;
    use crate::sync::backend::testing::{FakeMicrophone, GateKey, GatedBackend};
    use crate::sync::backend::{BackendOp, InMemoryBackend};
    use crate::sync::conversation::LoadOutcome;
    use crate::sync::reply::CannedReply;

    fn binding(backend: Arc<dyn Backend>) -> SessionBinding {
        with_microphone(backend, Arc::new(FakeMicrophone::new()))
    }

    fn with_microphone(backend: Arc<dyn Backend>, microphone: Arc<FakeMicrophone>) -> SessionBinding {
        SessionBinding::new(
            backend,
            Arc::new(CannedReply::default()),
            microphone,
            AttachmentConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_ensure_profile_is_idempotent() {
        let backend = InMemoryBackend::new();
        let user = UserId::new();
        let first = ensure_profile(&backend, user).await.unwrap();
        let second = ensure_profile(&backend, user).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.profile_count(), 1);
    }

    #[tokio::test]
    async fn test_sign_in_loads_conversations() {
        let backend = Arc::new(InMemoryBackend::new());
        let user = UserId::new();
        backend.create_conversation(user, "existing").await.unwrap();
        let binding = binding(backend.clone());

        binding.on_identity_change(Some(user)).await.unwrap();
        assert_eq!(binding.identity().await, Some(user));
        assert_eq!(backend.profile_count(), 1);
        let store = binding.store().await.unwrap();
        assert_eq!(store.owner(), user);
        assert_eq!(store.conversations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_identity_keeps_store() {
        let binding = binding(Arc::new(InMemoryBackend::new()));
        let user = UserId::new();
        binding.on_identity_change(Some(user)).await.unwrap();
        let store = binding.store().await.unwrap();
        let chat = store.create("kept").await.unwrap();
        store.select(chat.id).await.unwrap();

        binding.on_identity_change(Some(user)).await.unwrap();
        let again = binding.store().await.unwrap();
        assert!(Arc::ptr_eq(&store, &again));
        assert!(again.active().await.is_some());
    }

    #[tokio::test]
    async fn test_sign_out_clears_store() {
        let binding = binding(Arc::new(InMemoryBackend::new()));
        let user = UserId::new();
        binding.on_identity_change(Some(user)).await.unwrap();
        let store = binding.store().await.unwrap();
        let chat = store.create("c").await.unwrap();
        store.select(chat.id).await.unwrap();

        binding.on_identity_change(None).await.unwrap();
        assert!(binding.store().await.is_none());
        assert!(binding.identity().await.is_none());
        assert!(store.conversations().await.is_empty());
        assert!(store.active().await.is_none());
    }

    #[tokio::test]
    async fn test_switching_identity_builds_new_store() {
        let backend = Arc::new(InMemoryBackend::new());
        let alice = UserId::new();
        let bob = UserId::new();
        backend.create_conversation(alice, "alice's").await.unwrap();
        let binding = binding(backend);

        binding.on_identity_change(Some(alice)).await.unwrap();
        let first = binding.store().await.unwrap();
        binding.on_identity_change(Some(bob)).await.unwrap();
        let second = binding.store().await.unwrap();

        assert_eq!(second.owner(), bob);
        assert!(second.conversations().await.is_empty());
        assert!(first.conversations().await.is_empty());
    }

    #[tokio::test]
    async fn test_late_fetch_after_sign_out_is_discarded() {
        let backend = Arc::new(GatedBackend::new());
        let user = UserId::new();
        backend.inner().create_conversation(user, "c").await.unwrap();
        let binding = Arc::new(binding(backend.clone()));
        let gate = backend.hold(GateKey::ListConversations(user));

        let sign_in = tokio::spawn({
            let binding = Arc::clone(&binding);
            async move { binding.sign_in(user).await }
        });
        gate.entered().await;
        let store = binding.store().await.unwrap();

        binding.sign_out().await;
        gate.release();
        sign_in.await.unwrap().unwrap();

        assert!(binding.store().await.is_none());
        assert!(store.conversations().await.is_empty());
        assert_eq!(store.fetch_all().await.unwrap(), LoadOutcome::Applied(1));
    }

    #[tokio::test]
    async fn test_superseded_sign_in_does_not_install_store() {
        let backend = Arc::new(GatedBackend::new());
        let user = UserId::new();
        let binding = Arc::new(binding(backend.clone()));
        let gate = backend.hold(GateKey::GetProfile(user));

        let sign_in = tokio::spawn({
            let binding = Arc::clone(&binding);
            async move { binding.sign_in(user).await }
        });
        gate.entered().await;
        binding.sign_out().await;
        gate.release();
        sign_in.await.unwrap().unwrap();

        assert!(binding.store().await.is_none());
        assert!(binding.identity().await.is_none());
    }

    #[tokio::test]
    async fn test_profile_failure_leaves_signed_out() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_next(BackendOp::GetProfile, "auth expired");
        let binding = binding(backend);

        assert!(binding.on_identity_change(Some(UserId::new())).await.is_err());
        assert!(binding.identity().await.is_none());
        assert!(binding.store().await.is_none());
    }

    #[tokio::test]
    async fn test_ensure_profile_conflict_without_profile_is_missing() {
        let backend = GatedBackend::new();
        backend.conflict_on_create_profile();
        let result = ensure_profile(&backend, UserId::new()).await;
        assert!(matches!(
            result,
            Err(SyncError::Backend(BackendError::Missing(_)))
        ));
    }

    #[tokio::test]
    async fn test_sign_out_releases_microphone() {
        let microphone = Arc::new(FakeMicrophone::new());
        let binding = with_microphone(Arc::new(InMemoryBackend::new()), Arc::clone(&microphone));
        binding.sign_in(UserId::new()).await.unwrap();
        let attachments = binding.attachments().await.unwrap();

        attachments.start_capture().await.unwrap();
        assert_eq!(microphone.held(), 1);

        binding.sign_out().await;
        assert_eq!(microphone.held(), 0);
        assert!(binding.attachments().await.is_none());
        assert!(matches!(
            attachments.stop_capture().await,
            Err(SyncError::NotCapturing)
        ));
    }

    #[tokio::test]
    async fn test_upload_finishing_after_sign_out_is_dropped() {
        let backend = Arc::new(GatedBackend::new());
        let binding = binding(backend.clone());
        binding.sign_in(UserId::new()).await.unwrap();
        let attachments = binding.attachments().await.unwrap();
        let gate = backend.hold(GateKey::UploadBlob);

        let upload = tokio::spawn({
            let attachments = Arc::clone(&attachments);
            async move {
                attachments
                    .attach_file("a.txt", b"abc".to_vec(), "text/plain")
                    .await
            }
        });
        gate.entered().await;
        binding.sign_out().await;
        gate.release();
        upload.await.unwrap().unwrap();

        assert_eq!(attachments.state().await, PipelineState::Idle);
        assert!(attachments.take_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_switching_identity_replaces_pipeline() {
        let microphone = Arc::new(FakeMicrophone::new());
        let binding = with_microphone(Arc::new(InMemoryBackend::new()), Arc::clone(&microphone));
        binding.on_identity_change(Some(UserId::new())).await.unwrap();
        let first = binding.attachments().await.unwrap();
        first.start_capture().await.unwrap();

        binding.on_identity_change(Some(UserId::new())).await.unwrap();
        let second = binding.attachments().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(microphone.held(), 0);
        assert_eq!(second.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_spawned_binding_follows_identity() {
        let backend = Arc::new(InMemoryBackend::new());
        let binding = Arc::new(binding(backend));
        let user = UserId::new();
        let (tx, rx) = watch::channel(None);
        let task = Arc::clone(&binding).spawn(rx);

        tx.send(Some(user)).unwrap();
        wait_for(|| {
            let binding = Arc::clone(&binding);
            async move { binding.store().await.is_some() }
        })
        .await;
        assert_eq!(binding.identity().await, Some(user));

        tx.send(None).unwrap();
        wait_for(|| {
            let binding = Arc::clone(&binding);
            async move { binding.store().await.is_none() }
        })
        .await;

        task.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawned_binding_stops_when_sender_dropped() {
        let binding = Arc::new(binding(Arc::new(InMemoryBackend::new())));
        let (tx, rx) = watch::channel(Some(UserId::new()));
        let task = Arc::clone(&binding).spawn(rx);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), task.join())
            .await
            .unwrap();
    }

    async fn wait_for<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}
