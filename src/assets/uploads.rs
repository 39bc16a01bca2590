use super::folders::FolderTree;
use crate::models::{Field, FieldGroup, FieldStatus, find_field_mut, uploaded_label};
use crate::services::{AssetLibrary, AssetPayload, AssetUploadError, AssetUploadResult};
use serde::Serialize;
use std::{collections::HashMap, fmt, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldKey {
    pub group_id: String,
    pub field_name: String,
}

impl FieldKey {
    pub fn new(group_id: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            field_name: field_name.into(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.field_name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("an upload is already in progress for `{0}`")]
    InProgress(FieldKey),
    #[error("unknown field `{0}`")]
    UnknownField(FieldKey),
    #[error("`{0}` is a text field and cannot be uploaded")]
    NotAnAsset(FieldKey),
    #[error("unknown asset folder `{0}`")]
    UnknownFolder(String),
    #[error("asset folder `{0}` is not a leaf destination")]
    FolderNotLeaf(String),
}

type UploadResult = Result<AssetUploadResult, AssetUploadError>;

/// Resolves once the library call behind one `begin_upload` finishes.
#[derive(Debug)]
pub struct UploadHandle {
    pub key: FieldKey,
    ticket: Uuid,
    rx: oneshot::Receiver<UploadResult>,
}

impl UploadHandle {
    pub async fn wait(self) -> UploadOutcome {
        let result = self.rx.await.unwrap_or(Err(AssetUploadError::Abandoned));
        UploadOutcome {
            key: self.key,
            ticket: self.ticket,
            result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub key: FieldKey,
    ticket: Uuid,
    pub result: UploadResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    Completed,
    Failed,
    /// The upload was abandoned or superseded; the field was left alone.
    Discarded,
}

struct InFlight {
    ticket: Uuid,
    prior: FieldStatus,
    started: Instant,
    task: JoinHandle<()>,
}

/// Tracks at most one in-flight upload per (group, field).
pub struct UploadCoordinator {
    library: Arc<dyn AssetLibrary>,
    folders: Arc<FolderTree>,
    in_flight: HashMap<FieldKey, InFlight>,
}

impl UploadCoordinator {
    pub fn new(library: Arc<dyn AssetLibrary>, folders: Arc<FolderTree>) -> Self {
        Self {
            library,
            folders,
            in_flight: HashMap::new(),
        }
    }

    pub fn folders(&self) -> &Arc<FolderTree> {
        &self.folders
    }

    pub fn check_folder(&self, folder_id: &str) -> Result<(), UploadError> {
        let node = self
            .folders
            .get(folder_id)
            .ok_or_else(|| UploadError::UnknownFolder(folder_id.to_string()))?;
        if !node.is_leaf() {
            return Err(UploadError::FolderNotLeaf(folder_id.to_string()));
        }
        Ok(())
    }

    pub fn is_in_flight(&self, key: &FieldKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_keys(&self) -> Vec<FieldKey> {
        self.in_flight.keys().cloned().collect()
    }

    /// Marks the field Uploading and starts the library call in the background.
    pub fn begin_upload<S>(
        &mut self,
        groups: &mut [FieldGroup],
        key: FieldKey,
        folder_id: &str,
        sources_for: S,
    ) -> Result<UploadHandle, UploadError>
    where
        S: Fn(&Field) -> Vec<String>,
    {
        self.check_folder(folder_id)?;
        if self.in_flight.contains_key(&key) {
            return Err(UploadError::InProgress(key));
        }
        let field = find_field_mut(groups, &key.group_id, &key.field_name)
            .ok_or_else(|| UploadError::UnknownField(key.clone()))?;
        let Some(target) = field.target_asset_count().filter(|_| field.is_asset()) else {
            return Err(UploadError::NotAnAsset(key));
        };

        let prior = match field.status {
            FieldStatus::Uploading => FieldStatus::Pending,
            status => status,
        };
        let payload = AssetPayload {
            field_name: field.name.clone(),
            kind: field.kind,
            count: target,
            sources: sources_for(field),
        };
        field.status = FieldStatus::Uploading;
        field.last_error = None;

        let (tx, rx) = oneshot::channel();
        let library = self.library.clone();
        let folder = folder_id.to_string();
        let task = tokio::spawn(async move {
            let result = library.upload(&folder, payload).await.and_then(|done| {
                if done.uploaded_count < target {
                    Err(AssetUploadError::Partial {
                        uploaded: done.uploaded_count,
                        expected: target,
                    })
                } else {
                    Ok(done)
                }
            });
            let _ = tx.send(result);
        });

        let ticket = Uuid::new_v4();
        info!(
            target = "wizard.uploads",
            field = %key,
            folder = %folder_id,
            assets = target,
            "upload_started"
        );
        self.in_flight.insert(
            key.clone(),
            InFlight {
                ticket,
                prior,
                started: Instant::now(),
                task,
            },
        );
        Ok(UploadHandle { key, ticket, rx })
    }

    /// Starts uploads for every asset field that still needs one. Fields
    /// already in flight, awaiting generation, completed or empty are skipped.
    pub fn begin_upload_all<S>(
        &mut self,
        groups: &mut [FieldGroup],
        folder_id: &str,
        sources_for: S,
    ) -> Result<Vec<UploadHandle>, UploadError>
    where
        S: Fn(&Field) -> Vec<String>,
    {
        self.check_folder(folder_id)?;
        let eligible: Vec<FieldKey> = groups
            .iter()
            .flat_map(|group| {
                group
                    .fields
                    .iter()
                    .filter(|field| is_eligible(field))
                    .map(move |field| FieldKey::new(group.id.clone(), field.name.clone()))
            })
            .filter(|key| !self.in_flight.contains_key(key))
            .collect();

        let mut handles = Vec::with_capacity(eligible.len());
        for key in eligible {
            handles.push(self.begin_upload(groups, key, folder_id, &sources_for)?);
        }
        Ok(handles)
    }

    /// Writes a finished upload into its field. Outcomes whose ticket no
    /// longer matches the in-flight entry are discarded.
    pub fn apply(&mut self, groups: &mut [FieldGroup], outcome: UploadOutcome) -> Applied {
        let current = self
            .in_flight
            .get(&outcome.key)
            .is_some_and(|entry| entry.ticket == outcome.ticket);
        if !current {
            debug!(target = "wizard.uploads", field = %outcome.key, "stale_upload_outcome_discarded");
            return Applied::Discarded;
        }
        let Some(entry) = self.in_flight.remove(&outcome.key) else {
            return Applied::Discarded;
        };
        let elapsed_ms = entry.started.elapsed().as_millis();
        let Some(field) = find_field_mut(groups, &outcome.key.group_id, &outcome.key.field_name)
        else {
            return Applied::Discarded;
        };

        match outcome.result {
            Ok(_) => {
                if let Some(assets) = field.assets.as_mut() {
                    assets.mark_complete();
                    field.value = uploaded_label(assets.target());
                }
                field.status = FieldStatus::Completed;
                field.last_error = None;
                crate::metrics::upload_finished(&field.name, true, elapsed_ms);
                info!(target = "wizard.uploads", field = %outcome.key, elapsed_ms = elapsed_ms as u64, "upload_completed");
                Applied::Completed
            }
            Err(err) => {
                field.status = entry.prior;
                field.last_error = Some(err.to_string());
                crate::metrics::upload_finished(&field.name, false, elapsed_ms);
                warn!(target = "wizard.uploads", field = %outcome.key, error = %err, "upload_failed");
                Applied::Failed
            }
        }
    }

    /// Aborts every in-flight upload and restores the fields' prior statuses.
    pub fn abandon_all(&mut self, groups: &mut [FieldGroup]) -> usize {
        let abandoned = self.in_flight.len();
        for (key, entry) in self.in_flight.drain() {
            entry.task.abort();
            if let Some(field) = find_field_mut(groups, &key.group_id, &key.field_name)
                && field.status == FieldStatus::Uploading
            {
                field.status = entry.prior;
            }
            info!(target = "wizard.uploads", field = %key, "upload_abandoned");
        }
        abandoned
    }
}

impl Drop for UploadCoordinator {
    fn drop(&mut self) {
        for entry in self.in_flight.values() {
            entry.task.abort();
        }
    }
}

fn is_eligible(field: &Field) -> bool {
    field.is_asset()
        && field.target_asset_count().is_some_and(|target| target > 0)
        && !matches!(
            field.status,
            FieldStatus::Completed | FieldStatus::NeedsGeneration | FieldStatus::Uploading
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::merge::merge;
    use crate::models::find_field;
    use crate::testing::{GatedLibrary, sample_collected};

    fn setup(library: Arc<GatedLibrary>) -> (UploadCoordinator, Vec<FieldGroup>) {
        let catalog = Catalog::builtin().unwrap();
        let groups = merge(&catalog.layout, &sample_collected(), None, None).unwrap();
        let tree = Arc::new(FolderTree::from_specs(&catalog.folders));
        (UploadCoordinator::new(library, tree), groups)
    }

    fn no_sources(_: &Field) -> Vec<String> {
        Vec::new()
    }

    fn main_key() -> FieldKey {
        FieldKey::new("media", "Main images 1:1")
    }

    #[tokio::test]
    async fn second_begin_on_same_field_is_rejected() {
        let library = Arc::new(GatedLibrary::gated());
        let (mut coordinator, mut groups) = setup(library.clone());

        let handle = coordinator
            .begin_upload(&mut groups, main_key(), "grain-4", no_sources)
            .expect("first begin");
        let second = coordinator.begin_upload(&mut groups, main_key(), "grain-4", no_sources);
        assert_eq!(second.unwrap_err(), UploadError::InProgress(main_key()));
        assert_eq!(
            find_field(&groups, "media", "Main images 1:1").unwrap().status,
            FieldStatus::Uploading
        );

        library.release(1);
        let outcome = handle.wait().await;
        assert_eq!(coordinator.apply(&mut groups, outcome), Applied::Completed);
        let field = find_field(&groups, "media", "Main images 1:1").unwrap();
        assert_eq!(field.status, FieldStatus::Completed);
        assert_eq!(field.uploaded_asset_count(), field.target_asset_count());
        assert_eq!(field.value, "5 uploaded");
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn failure_reverts_status_and_records_error() {
        let library = Arc::new(GatedLibrary::open());
        library.fail_field("Main images 1:1");
        let (mut coordinator, mut groups) = setup(library);

        let handle = coordinator
            .begin_upload(&mut groups, main_key(), "grain-4", no_sources)
            .unwrap();
        let outcome = handle.wait().await;
        assert_eq!(coordinator.apply(&mut groups, outcome), Applied::Failed);
        let field = find_field(&groups, "media", "Main images 1:1").unwrap();
        assert_eq!(field.status, FieldStatus::Pending);
        assert_eq!(field.uploaded_asset_count(), Some(0));
        assert!(field.last_error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn short_upload_counts_as_failure() {
        let library = Arc::new(GatedLibrary::open());
        library.short_field("Main images 1:1");
        let (mut coordinator, mut groups) = setup(library);
        let handle = coordinator
            .begin_upload(&mut groups, main_key(), "grain-4", no_sources)
            .unwrap();
        let outcome = handle.wait().await;
        assert!(matches!(
            outcome.result,
            Err(AssetUploadError::Partial { uploaded: 4, expected: 5 })
        ));
        assert_eq!(coordinator.apply(&mut groups, outcome), Applied::Failed);
    }

    #[tokio::test]
    async fn text_fields_and_bad_folders_are_rejected() {
        let (mut coordinator, mut groups) = setup(Arc::new(GatedLibrary::open()));
        let title = FieldKey::new("basic", "Title");
        assert_eq!(
            coordinator
                .begin_upload(&mut groups, title.clone(), "grain-4", no_sources)
                .unwrap_err(),
            UploadError::NotAnAsset(title)
        );
        assert_eq!(
            find_field(&groups, "basic", "Title").unwrap().status,
            FieldStatus::Pending
        );
        assert_eq!(
            coordinator
                .begin_upload(&mut groups, main_key(), "product", no_sources)
                .unwrap_err(),
            UploadError::FolderNotLeaf("product".into())
        );
        assert!(matches!(
            coordinator.begin_upload(&mut groups, main_key(), "nowhere", no_sources),
            Err(UploadError::UnknownFolder(_))
        ));
        assert!(matches!(
            coordinator.begin_upload(&mut groups, FieldKey::new("media", "Nope"), "grain-4", no_sources),
            Err(UploadError::UnknownField(_))
        ));
    }

    #[tokio::test]
    async fn upload_all_skips_completed_and_generation_fields() {
        let library = Arc::new(GatedLibrary::open());
        let (mut coordinator, mut groups) = setup(library);
        {
            let detail = groups[0].field_mut("Detail images").unwrap();
            detail.status = FieldStatus::Completed;
            detail.assets.as_mut().unwrap().mark_complete();
        }

        let handles = coordinator
            .begin_upload_all(&mut groups, "grain-4", no_sources)
            .unwrap();
        let mut started: Vec<String> = handles.iter().map(|h| h.key.field_name.clone()).collect();
        started.sort();
        assert_eq!(started, vec!["Main images 1:1", "Product video"]);

        for handle in handles {
            let outcome = handle.wait().await;
            coordinator.apply(&mut groups, outcome);
        }
        assert_eq!(
            find_field(&groups, "media", "Product video").unwrap().status,
            FieldStatus::Completed
        );
        assert_eq!(
            find_field(&groups, "media", "White background image").unwrap().status,
            FieldStatus::NeedsGeneration
        );
    }

    #[tokio::test]
    async fn upload_all_fields_fail_independently() {
        let library = Arc::new(GatedLibrary::open());
        library.fail_field("Detail images");
        let (mut coordinator, mut groups) = setup(library);

        let handles = coordinator
            .begin_upload_all(&mut groups, "grain-4", no_sources)
            .unwrap();
        assert_eq!(handles.len(), 3);
        for handle in handles {
            let outcome = handle.wait().await;
            let expected = if outcome.key.field_name == "Detail images" {
                Applied::Failed
            } else {
                Applied::Completed
            };
            assert_eq!(coordinator.apply(&mut groups, outcome), expected);
        }

        let detail = find_field(&groups, "media", "Detail images").unwrap();
        assert_eq!(detail.status, FieldStatus::Pending);
        assert_eq!(detail.uploaded_asset_count(), Some(0));
        assert!(detail.last_error.as_deref().unwrap().contains("boom"));
        for name in ["Main images 1:1", "Product video"] {
            let field = find_field(&groups, "media", name).unwrap();
            assert_eq!(field.status, FieldStatus::Completed, "{name}");
            assert!(field.last_error.is_none());
        }
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_uploads_revert_and_late_outcomes_are_discarded() {
        let library = Arc::new(GatedLibrary::gated());
        let (mut coordinator, mut groups) = setup(library.clone());
        let handle = coordinator
            .begin_upload(&mut groups, main_key(), "grain-4", no_sources)
            .unwrap();

        assert_eq!(coordinator.abandon_all(&mut groups), 1);
        assert_eq!(
            find_field(&groups, "media", "Main images 1:1").unwrap().status,
            FieldStatus::Pending
        );

        library.release(1);
        let outcome = handle.wait().await;
        assert_eq!(coordinator.apply(&mut groups, outcome), Applied::Discarded);
        assert_eq!(
            find_field(&groups, "media", "Main images 1:1").unwrap().status,
            FieldStatus::Pending
        );
    }

    #[tokio::test]
    async fn completed_fields_can_be_uploaded_again() {
        let (mut coordinator, mut groups) = setup(Arc::new(GatedLibrary::open()));
        for _ in 0..2 {
            let handle = coordinator
                .begin_upload(&mut groups, main_key(), "grain-4", no_sources)
                .unwrap();
            let outcome = handle.wait().await;
            assert_eq!(coordinator.apply(&mut groups, outcome), Applied::Completed);
        }
    }
}
