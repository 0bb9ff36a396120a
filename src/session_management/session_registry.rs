use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::data_capture::activity_capture::{ActivityCapture, CaptureSettings};
use crate::error_handling::types::SessionError;
use crate::sandbox::provider::SandboxProvider;
use crate::session_management::sandbox_handle::SandboxHandle;
use crate::storage::storage_trait::Storage;
use crate::terminal_relay::broadcast_hub::BroadcastHub;

/// Process-local cache of live sandbox handles, keyed by session.
///
/// Reconnection is serialized per session: concurrent callers that all miss
/// the cache queue on the same lock, and only the first one connects. Distinct
/// sessions never contend.
pub struct SessionRegistry {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn SandboxProvider>,
    hub: Arc<BroadcastHub>,
    capture: CaptureSettings,
    handles: RwLock<HashMap<Uuid, Arc<SandboxHandle>>>,
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn SandboxProvider>,
        hub: Arc<BroadcastHub>,
        capture: CaptureSettings,
    ) -> Self {
        Self {
            storage,
            provider,
            hub,
            capture,
            handles: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn capture_settings(&self) -> &CaptureSettings {
        &self.capture
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// The lock serializing connection changes for one session.
    pub fn session_lock(&self, session_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drops the lock entry of a session that will never reconnect again.
    pub fn release_lock(&self, session_id: Uuid) {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.remove(&session_id);
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        match self.locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Cached handle with a live terminal, without any I/O.
    pub fn cached(&self, session_id: Uuid) -> Option<Arc<SandboxHandle>> {
        let handles = match self.handles.read() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles
            .get(&session_id)
            .filter(|handle| handle.is_live())
            .cloned()
    }

    /// Returns the live handle for a session, reconnecting from the persisted
    /// `sandbox_id` when the cache has none.
    ///
    /// `Ok(None)` means there is no sandbox to talk to: the session is unknown,
    /// completed, was never provisioned, or the provider refused the connection.
    pub async fn get_or_reconnect(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Arc<SandboxHandle>>, SessionError> {
        if let Some(handle) = self.cached(session_id) {
            return Ok(Some(handle));
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        if let Some(handle) = self.cached(session_id) {
            debug!("[{}] Reconnected by a concurrent request", session_id);
            return Ok(Some(handle));
        }
        self.evict(session_id);
        self.reconnect(session_id).await
    }

    /// Replaces a handle the caller found stale.
    ///
    /// When another request already swapped `stale` for a live handle while this
    /// one waited on the lock, that handle is returned and no new connection is
    /// opened. With `stale` set to `None` the cached handle is always replaced.
    pub async fn force_reconnect(
        &self,
        session_id: Uuid,
        stale: Option<&Arc<SandboxHandle>>,
    ) -> Result<Option<Arc<SandboxHandle>>, SessionError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        if let (Some(stale), Some(current)) = (stale, self.cached(session_id)) {
            if !Arc::ptr_eq(stale, &current) {
                debug!("[{}] Stale handle already replaced", session_id);
                return Ok(Some(current));
            }
        }
        self.evict(session_id);
        self.reconnect(session_id).await
    }

    /// Caches a handle for a freshly provisioned sandbox, replacing any old one.
    pub fn insert(&self, session_id: Uuid, handle: Arc<SandboxHandle>) {
        let previous = match self.handles.write() {
            Ok(mut handles) => handles.insert(session_id, handle),
            Err(poisoned) => poisoned.into_inner().insert(session_id, handle),
        };
        if let Some(previous) = previous {
            previous.detach();
        }
    }

    /// Removes the cached handle, leaving its capture running.
    pub fn remove(&self, session_id: Uuid) -> Option<Arc<SandboxHandle>> {
        match self.handles.write() {
            Ok(mut handles) => handles.remove(&session_id),
            Err(poisoned) => poisoned.into_inner().remove(&session_id),
        }
    }

    fn evict(&self, session_id: Uuid) {
        if let Some(stale) = self.remove(session_id) {
            debug!(
                "[{}] Evicting handle for sandbox {}",
                session_id,
                stale.sandbox_id()
            );
            stale.detach();
        }
    }

    /// Must be called with the session lock held.
    async fn reconnect(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Arc<SandboxHandle>>, SessionError> {
        let Some(session) = self.storage.get_session(session_id).await? else {
            return Ok(None);
        };
        if session.is_completed() {
            debug!("[{}] Session completed, not reconnecting", session_id);
            return Ok(None);
        }
        let Some(sandbox_id) = session.sandbox_id else {
            return Ok(None);
        };

        let sandbox = match self.provider.connect(&sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!("[{}] Reconnect to sandbox {} failed: {}", session_id, sandbox_id, e);
                return Ok(None);
            }
        };
        let capture = match ActivityCapture::attach(
            &sandbox,
            session_id,
            self.storage.clone(),
            self.hub.clone(),
            &self.capture,
        )
        .await
        {
            Ok(capture) => capture,
            Err(e) => {
                warn!("[{}] Capture re-attach on {} failed: {}", session_id, sandbox_id, e);
                return Ok(None);
            }
        };

        let handle = Arc::new(SandboxHandle::new(session_id, sandbox, capture));
        self.insert(session_id, handle.clone());
        info!("[{}] Reconnected to sandbox {}", session_id, sandbox_id);
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::SessionStatus;
    use crate::test_support::{FakeProvider, MemStorage};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry(storage: &Arc<MemStorage>, provider: &Arc<FakeProvider>) -> Arc<SessionRegistry> {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(SessionRegistry::new(
            storage.clone(),
            provider.clone(),
            Arc::new(BroadcastHub::new()),
            CaptureSettings {
                project_root: "/home/user/project".into(),
                cols: 120,
                rows: 40,
                debounce: Duration::from_millis(500),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_connection() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        provider.add_sandbox("sbx-1");
        provider.set_connect_delay(Duration::from_millis(200));
        let session_id = storage.seed_active_session(&[("app.py", "")], "sbx-1");
        let registry = registry(&storage, &provider);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.get_or_reconnect(session_id).await
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap().unwrap());
        }

        assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(handles[0].sandbox_id(), "sbx-1");
    }

    #[tokio::test]
    async fn cache_hit_performs_no_io() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        provider.add_sandbox("sbx-1");
        let session_id = storage.seed_active_session(&[], "sbx-1");
        let registry = registry(&storage, &provider);

        registry.get_or_reconnect(session_id).await.unwrap().unwrap();
        registry.get_or_reconnect(session_id).await.unwrap().unwrap();
        assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completed_sessions_are_never_reconnected() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        provider.add_sandbox("sbx-1");
        let session_id = storage.seed_active_session(&[], "sbx-1");
        storage.set_status(session_id, SessionStatus::Completed);
        let registry = registry(&storage, &provider);

        assert!(registry.get_or_reconnect(session_id).await.unwrap().is_none());
        assert!(registry.force_reconnect(session_id, None).await.unwrap().is_none());
        assert_eq!(provider.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_sandbox_or_refused_connection_yield_none() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&storage, &provider);

        let pending = storage.seed_session(&[]);
        assert!(registry.get_or_reconnect(pending).await.unwrap().is_none());
        assert!(registry.get_or_reconnect(Uuid::new_v4()).await.unwrap().is_none());

        let orphan = storage.seed_active_session(&[], "sbx-gone");
        assert!(registry.get_or_reconnect(orphan).await.unwrap().is_none());

        provider.add_sandbox("sbx-1");
        provider.fail_connect.store(true, Ordering::SeqCst);
        let refused = storage.seed_active_session(&[], "sbx-1");
        assert!(registry.get_or_reconnect(refused).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_reconnect_replaces_the_cached_handle() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        provider.add_sandbox("sbx-1");
        let session_id = storage.seed_active_session(&[], "sbx-1");
        let registry = registry(&storage, &provider);

        let first = registry.get_or_reconnect(session_id).await.unwrap().unwrap();
        let second = registry.force_reconnect(session_id, Some(&first)).await.unwrap().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_live());
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&registry.cached(session_id).unwrap(), &second));
    }

    #[tokio::test]
    async fn dead_terminal_triggers_reconnect() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let fake = provider.add_sandbox("sbx-1");
        let session_id = storage.seed_active_session(&[], "sbx-1");
        let registry = registry(&storage, &provider);

        let first = registry.get_or_reconnect(session_id).await.unwrap().unwrap();
        fake.close_pty();
        for _ in 0..50 {
            if !first.is_live() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let second = registry.get_or_reconnect(session_id).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stale_recoveries_share_one_replacement() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        provider.add_sandbox("sbx-1");
        let session_id = storage.seed_active_session(&[], "sbx-1");
        let registry = registry(&storage, &provider);
        let stale = registry.get_or_reconnect(session_id).await.unwrap().unwrap();
        provider.set_connect_delay(Duration::from_millis(200));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let stale = stale.clone();
            tasks.push(tokio::spawn(async move {
                registry.force_reconnect(session_id, Some(&stale)).await
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap().unwrap());
        }

        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert!(handles[0].is_live());
        assert!(!stale.is_live());
        assert!(Arc::ptr_eq(&registry.cached(session_id).unwrap(), &handles[0]));
    }

    #[tokio::test]
    async fn released_locks_are_forgotten() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&storage, &provider);
        let session_id = Uuid::new_v4();

        let first = registry.session_lock(session_id);
        assert!(Arc::ptr_eq(&first, &registry.session_lock(session_id)));
        assert_eq!(registry.tracked_locks(), 1);

        registry.release_lock(session_id);
        assert_eq!(registry.tracked_locks(), 0);
    }
}
