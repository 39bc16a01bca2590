use crate::{
    assets::{FieldKey, FolderTree, UploadHandle},
    catalog::Catalog,
    models::SubmissionReceipt,
    services::Services,
    wizard::{WizardError, WizardSession},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub type SharedSession = Arc<Mutex<WizardSession>>;

/// In-memory registry of live wizard sessions.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<Uuid, SharedSession>>>,
    services: Services,
    catalog: Arc<Catalog>,
    folders: Arc<FolderTree>,
}

impl SessionStore {
    pub fn new(services: Services, catalog: Arc<Catalog>, folders: Arc<FolderTree>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            services,
            catalog,
            folders,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn folders(&self) -> &Arc<FolderTree> {
        &self.folders
    }

    pub async fn create(&self) -> (Uuid, SharedSession) {
        let session = WizardSession::new(
            self.services.clone(),
            self.catalog.clone(),
            self.folders.clone(),
        );
        let id = session.id();
        let shared = Arc::new(Mutex::new(session));
        self.sessions.lock().await.insert(id, shared.clone());
        info!(target = "wizard.sessions", session = %id, "session created");
        (id, shared)
    }

    pub async fn get(&self, id: Uuid) -> Option<SharedSession> {
        self.sessions.lock().await.get(&id).cloned()
    }

    /// Removes the session and abandons its in-flight uploads.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.sessions.lock().await.remove(&id);
        let Some(session) = removed else {
            return false;
        };
        let abandoned = session.lock().await.abandon();
        info!(target = "wizard.sessions", session = %id, abandoned, "session removed");
        true
    }
}

// Collaborator calls: prepare under the lock, await unlocked, apply under the
// lock again. The session's pending-call ticket rejects overlapping calls and
// drops results that arrive after the session was abandoned.

pub async fn collect(session: &SharedSession, source_url: &str) -> Result<(), WizardError> {
    let call = session.lock().await.begin_collect(source_url)?;
    let done = call.run().await;
    session.lock().await.finish_collect(done)
}

pub async fn match_datasource(session: &SharedSession, datasource_id: &str) -> Result<(), WizardError> {
    let call = session.lock().await.begin_match(datasource_id)?;
    let done = call.run().await;
    session.lock().await.finish_match(done)
}

pub async fn submit(session: &SharedSession) -> Result<SubmissionReceipt, WizardError> {
    let call = session.lock().await.begin_submit()?;
    let done = call.run().await;
    session.lock().await.finish_submit(done)
}

/// Spawns one waiter per handle that writes the upload's outcome back into
/// the session once it resolves.
pub fn track_uploads(session: &SharedSession, handles: Vec<UploadHandle>) -> Vec<FieldKey> {
    handles
        .into_iter()
        .map(|handle| {
            let key = handle.key.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let outcome = handle.wait().await;
                let field = outcome.key.clone();
                let applied = session.lock().await.apply_upload(outcome);
                debug!(target = "wizard.sessions", field = %field, applied = ?applied, "upload outcome applied");
            });
            key
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldStatus;
    use crate::testing::{GatedCollector, GatedLibrary, ScriptedMarketplace, catalog, test_services};
    use crate::wizard::Stage;
    use tokio::time::{Duration, sleep, timeout};

    fn store(library: Arc<GatedLibrary>) -> SessionStore {
        let catalog = catalog();
        let folders = Arc::new(FolderTree::from_specs(&catalog.folders));
        let services = test_services(library, Arc::new(ScriptedMarketplace::failing(0)));
        SessionStore::new(services, catalog, folders)
    }

    async fn field_review(session: &SharedSession) {
        let mut guard = session.lock().await;
        guard
            .collect("https://item.taobao.com/item.htm?id=42")
            .await
            .unwrap();
        guard.advance().unwrap();
        guard
            .select_category(vec![
                "Snacks & Nuts".into(),
                "Nuts".into(),
                "Sesame".into(),
            ])
            .unwrap();
        guard.advance().unwrap();
        guard.select_folder("grain-5").unwrap();
    }

    #[tokio::test]
    async fn create_get_remove() {
        let store = store(Arc::new(GatedLibrary::open()));
        let (id, _) = store.create().await;
        assert!(store.get(id).await.is_some());
        assert!(store.remove(id).await);
        assert!(store.get(id).await.is_none());
        assert!(!store.remove(id).await);
    }

    #[tokio::test]
    async fn waiter_applies_upload_outcome() {
        let library = Arc::new(GatedLibrary::gated());
        let store = store(library.clone());
        let (_, session) = store.create().await;
        field_review(&session).await;

        let handle = session
            .lock()
            .await
            .begin_upload("media", "Detail images")
            .unwrap();
        let keys = track_uploads(&session, vec![handle]);
        assert_eq!(keys, vec![FieldKey::new("media", "Detail images")]);

        library.release(1);
        let mut status = FieldStatus::Uploading;
        for _ in 0..50 {
            status = session
                .lock()
                .await
                .field("media", "Detail images")
                .map(|field| field.status)
                .unwrap();
            if status != FieldStatus::Uploading {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, FieldStatus::Completed);
    }

    #[tokio::test]
    async fn removing_a_session_abandons_uploads() {
        let library = Arc::new(GatedLibrary::gated());
        let store = store(library.clone());
        let (id, session) = store.create().await;
        field_review(&session).await;
        let handles = session.lock().await.begin_upload_all().unwrap();
        track_uploads(&session, handles);

        assert!(store.remove(id).await);
        let guard = session.lock().await;
        assert_eq!(
            guard.field("media", "Main images 1:1").unwrap().status,
            FieldStatus::Pending
        );
        assert!(!guard.is_uploading(&FieldKey::new("media", "Main images 1:1")));
    }

    fn store_with_collector(collector: Arc<GatedCollector>) -> SessionStore {
        let catalog = catalog();
        let folders = Arc::new(FolderTree::from_specs(&catalog.folders));
        let mut services = test_services(
            Arc::new(GatedLibrary::open()),
            Arc::new(ScriptedMarketplace::failing(0)),
        );
        services.collector = collector;
        SessionStore::new(services, catalog, folders)
    }

    async fn wait_for_pending(session: &SharedSession) {
        for _ in 0..50 {
            if session.lock().await.pending_call().is_some() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("collaborator call never started");
    }

    #[tokio::test]
    async fn session_stays_readable_while_collecting() {
        let collector = Arc::new(GatedCollector::new());
        let store = store_with_collector(collector.clone());
        let (_, session) = store.create().await;

        let running = tokio::spawn({
            let session = session.clone();
            async move { collect(&session, "https://item.taobao.com/item.htm?id=42").await }
        });
        wait_for_pending(&session).await;

        let stage = timeout(Duration::from_millis(500), async {
            session.lock().await.stage()
        })
        .await
        .expect("read blocked by collection");
        assert_eq!(stage, Stage::Collecting);

        let second = session
            .lock()
            .await
            .begin_collect("https://item.taobao.com/item.htm?id=42")
            .err()
            .unwrap();
        assert_eq!(second.code(), "call_in_progress");
        assert_eq!(session.lock().await.advance().unwrap_err().code(), "call_in_progress");

        collector.release(1);
        running.await.unwrap().unwrap();
        let guard = session.lock().await;
        assert!(guard.pending_call().is_none());
        assert_eq!(guard.skus().len(), 2);
    }

    #[tokio::test]
    async fn collection_finishing_after_removal_is_dropped() {
        let collector = Arc::new(GatedCollector::new());
        let store = store_with_collector(collector.clone());
        let (id, session) = store.create().await;

        let running = tokio::spawn({
            let session = session.clone();
            async move { collect(&session, "https://item.taobao.com/item.htm?id=42").await }
        });
        wait_for_pending(&session).await;
        assert!(store.remove(id).await);

        collector.release(1);
        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "superseded");
        assert!(session.lock().await.skus().is_empty());
    }
}
