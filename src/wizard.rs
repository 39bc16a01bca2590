use crate::assets::{Applied, FieldKey, FolderSelection, FolderTree, UploadCoordinator, UploadError, UploadHandle, UploadOutcome};
use crate::catalog::Catalog;
use crate::merge::{MergeError, carry_forward, merge};
use crate::models::{
    AssetOrigin, CollectedProduct, CollectedSku, Field, FieldGroup, FieldSource, FieldStatus,
    ListingPayload, PriceMode, SessionEvent, Sku, SubmissionReceipt, UploadMode, all_fields,
    find_field, find_field_mut,
};
use crate::pricing::{PricingError, PricingState, price_delta};
use crate::services::{
    CollectionError, Collector, DatasourceMatcher, Marketplace, MatchError, Services,
    SubmissionError, TemplateError,
};
use crate::validator::{self, CheckResult, ListingView};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Field whose value backfills blank SKU external codes when pricing starts.
const EXTERNAL_CODE_FIELD: &str = "Organic code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collecting,
    Categorizing,
    FieldReview,
    SkuPricing,
    Submitting,
}

impl Stage {
    pub fn number(self) -> u8 {
        match self {
            Stage::Collecting => 1,
            Stage::Categorizing => 2,
            Stage::FieldReview => 3,
            Stage::SkuPricing => 4,
            Stage::Submitting => 5,
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Collecting => Some(Stage::Categorizing),
            Stage::Categorizing => Some(Stage::FieldReview),
            Stage::FieldReview => Some(Stage::SkuPricing),
            Stage::SkuPricing => Some(Stage::Submitting),
            Stage::Submitting => None,
        }
    }

    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::Collecting => None,
            Stage::Categorizing => Some(Stage::Collecting),
            Stage::FieldReview => Some(Stage::Categorizing),
            Stage::SkuPricing => Some(Stage::FieldReview),
            Stage::Submitting => Some(Stage::SkuPricing),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Collecting => "collecting",
            Stage::Categorizing => "categorizing",
            Stage::FieldReview => "field_review",
            Stage::SkuPricing => "sku_pricing",
            Stage::Submitting => "submitting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    NotSubmitted,
    Failed { error: String },
    Submitted { receipt: SubmissionReceipt },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardErrorKind {
    InvalidInput,
    Conflict,
    NotFound,
    Upstream,
}

#[derive(Debug, Error)]
pub enum WizardError {
    #[error("cannot leave {stage}: {reason}")]
    Guard { stage: Stage, reason: String },
    #[error("`{operation}` is not available while {stage}")]
    WrongStage { operation: &'static str, stage: Stage },
    #[error("the listing has already been submitted")]
    AlreadySubmitted,
    #[error("a source listing has already been collected")]
    AlreadyCollected,
    #[error("`{0}` is still in progress")]
    Busy(&'static str),
    #[error("`{0}` finished after the session moved on; its result was dropped")]
    Superseded(&'static str),
    #[error("no source listing has been collected yet")]
    NotCollected,
    #[error(transparent)]
    Collection(#[from] CollectionError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("`{0}` is not a leaf of the category tree")]
    UnknownCategory(String),
    #[error("unknown field `{group_id}/{name}`")]
    UnknownField { group_id: String, name: String },
    #[error("`{0}` is an asset field; upload it instead of editing")]
    NotEditable(String),
    #[error("`{0}` has no value to confirm")]
    EmptyField(String),
    #[error("select an asset folder first")]
    NoFolderSelected,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error("{0}")]
    Schedule(String),
    #[error("listing is not ready to submit: {0}")]
    NotReady(String),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

impl WizardError {
    /// Stable identifier rendered as the `error` of API responses.
    pub fn code(&self) -> &'static str {
        match self {
            WizardError::Guard { .. } => "stage_guard",
            WizardError::WrongStage { .. } => "wrong_stage",
            WizardError::AlreadySubmitted => "already_submitted",
            WizardError::AlreadyCollected => "already_collected",
            WizardError::Busy(_) => "call_in_progress",
            WizardError::Superseded(_) => "superseded",
            WizardError::NotCollected => "not_collected",
            WizardError::Collection(_) => "collection",
            WizardError::Merge(_) => "collection_incomplete",
            WizardError::Match(_) => "datasource_match",
            WizardError::Template(_) => "template",
            WizardError::UnknownCategory(_) => "unknown_category",
            WizardError::UnknownField { .. } => "unknown_field",
            WizardError::NotEditable(_) => "not_editable",
            WizardError::EmptyField(_) => "empty_field",
            WizardError::NoFolderSelected => "no_folder_selected",
            WizardError::Upload(UploadError::InProgress(_)) => "upload_in_progress",
            WizardError::Upload(_) => "upload",
            WizardError::Pricing(_) => "pricing",
            WizardError::Schedule(_) => "schedule",
            WizardError::NotReady(_) => "not_ready",
            WizardError::Submission(_) => "submission",
        }
    }

    pub fn kind(&self) -> WizardErrorKind {
        use WizardErrorKind::*;
        match self {
            WizardError::Guard { .. }
            | WizardError::WrongStage { .. }
            | WizardError::AlreadySubmitted
            | WizardError::AlreadyCollected
            | WizardError::Busy(_)
            | WizardError::Superseded(_)
            | WizardError::NotCollected
            | WizardError::NotReady(_) => Conflict,
            WizardError::Collection(CollectionError::InvalidUrl(_)) => InvalidInput,
            WizardError::Collection(CollectionError::Failed(_)) => Upstream,
            WizardError::Merge(_) => Upstream,
            WizardError::Match(MatchError::UnknownDatasource(_)) => NotFound,
            WizardError::Match(MatchError::Failed(_)) => Upstream,
            WizardError::Template(_) => NotFound,
            WizardError::UnknownCategory(_) => InvalidInput,
            WizardError::UnknownField { .. } => NotFound,
            WizardError::NotEditable(_) | WizardError::EmptyField(_) => InvalidInput,
            WizardError::NoFolderSelected => Conflict,
            WizardError::Upload(err) => match err {
                UploadError::InProgress(_) => Conflict,
                UploadError::UnknownField(_) | UploadError::UnknownFolder(_) => NotFound,
                UploadError::NotAnAsset(_) | UploadError::FolderNotLeaf(_) => InvalidInput,
            },
            WizardError::Pricing(err) => match err {
                PricingError::UnknownStrategy(_) | PricingError::UnknownSku(_) => NotFound,
                PricingError::FixedNotApplicable | PricingError::NegativePrice => InvalidInput,
            },
            WizardError::Schedule(_) => InvalidInput,
            WizardError::Submission(_) => Upstream,
        }
    }
}

/// Operator edits to one SKU. `id` and `original_price` are not editable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkuPatch {
    pub name: Option<String>,
    pub merchant_code: Option<String>,
    pub external_code: Option<String>,
    pub price: Option<Decimal>,
    pub stock: Option<u32>,
    pub enabled: Option<bool>,
    pub barcode: Option<String>,
    pub net_weight: Option<String>,
}

struct PendingCall {
    ticket: Uuid,
    operation: &'static str,
}

/// Collector call prepared by `begin_collect`. Running it touches no session
/// state, so it is awaited with the session unlocked.
pub struct CollectCall {
    ticket: Uuid,
    url: String,
    collector: Arc<dyn Collector>,
}

pub struct CollectDone {
    ticket: Uuid,
    url: String,
    elapsed_ms: u128,
    result: Result<CollectedProduct, CollectionError>,
}

impl CollectCall {
    pub async fn run(self) -> CollectDone {
        let started = Instant::now();
        let result = self.collector.collect(&self.url).await;
        CollectDone {
            ticket: self.ticket,
            url: self.url,
            elapsed_ms: started.elapsed().as_millis(),
            result,
        }
    }
}

pub struct MatchCall {
    ticket: Uuid,
    datasource_id: String,
    product: CollectedProduct,
    matcher: Arc<dyn DatasourceMatcher>,
}

pub struct MatchDone {
    ticket: Uuid,
    datasource_id: String,
    elapsed_ms: u128,
    result: Result<Vec<Field>, MatchError>,
}

impl MatchCall {
    pub async fn run(self) -> MatchDone {
        let started = Instant::now();
        let result = self
            .matcher
            .match_fields(&self.datasource_id, &self.product)
            .await;
        MatchDone {
            ticket: self.ticket,
            datasource_id: self.datasource_id,
            elapsed_ms: started.elapsed().as_millis(),
            result,
        }
    }
}

pub struct SubmitCall {
    ticket: Uuid,
    payload: ListingPayload,
    mode: UploadMode,
    scheduled_at: Option<DateTime<Utc>>,
    marketplace: Arc<dyn Marketplace>,
}

pub struct SubmitDone {
    ticket: Uuid,
    elapsed_ms: u128,
    result: Result<SubmissionReceipt, SubmissionError>,
}

impl SubmitCall {
    pub async fn run(self) -> SubmitDone {
        let started = Instant::now();
        let result = self
            .marketplace
            .submit(&self.payload, self.mode, self.scheduled_at)
            .await;
        SubmitDone {
            ticket: self.ticket,
            elapsed_ms: started.elapsed().as_millis(),
            result,
        }
    }
}

/// One listing run: the aggregate every stage operation reads and writes.
pub struct WizardSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    stage: Stage,
    source_product: Option<CollectedProduct>,
    category_path: Vec<String>,
    datasource_id: Option<String>,
    template_id: Option<String>,
    matched_fields: Option<Vec<Field>>,
    template_fields: Option<Vec<Field>>,
    field_groups: Vec<FieldGroup>,
    skus: Vec<Sku>,
    folder: Option<FolderSelection>,
    pricing: PricingState,
    upload_mode: UploadMode,
    scheduled_at: Option<DateTime<Utc>>,
    submission: SubmissionState,
    pending_payload: Option<ListingPayload>,
    pending_call: Option<PendingCall>,
    submit_gate: Arc<tokio::sync::Mutex<()>>,
    last_error: Option<String>,
    history: Vec<SessionEvent>,
    uploads: UploadCoordinator,
    services: Services,
    catalog: Arc<Catalog>,
}

impl WizardSession {
    pub fn new(services: Services, catalog: Arc<Catalog>, folders: Arc<FolderTree>) -> Self {
        let uploads = UploadCoordinator::new(services.assets.clone(), folders);
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            stage: Stage::Collecting,
            source_product: None,
            category_path: Vec::new(),
            datasource_id: None,
            template_id: None,
            matched_fields: None,
            template_fields: None,
            field_groups: Vec::new(),
            skus: Vec::new(),
            folder: None,
            pricing: PricingState::default(),
            upload_mode: UploadMode::default(),
            scheduled_at: None,
            submission: SubmissionState::NotSubmitted,
            pending_payload: None,
            pending_call: None,
            submit_gate: Arc::new(tokio::sync::Mutex::new(())),
            last_error: None,
            history: Vec::new(),
            uploads,
            services,
            catalog,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn field_groups(&self) -> &[FieldGroup] {
        &self.field_groups
    }

    pub fn skus(&self) -> &[Sku] {
        &self.skus
    }

    pub fn submission(&self) -> &SubmissionState {
        &self.submission
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn history(&self) -> &[SessionEvent] {
        &self.history
    }

    pub fn field(&self, group_id: &str, name: &str) -> Option<&Field> {
        find_field(&self.field_groups, group_id, name)
    }

    pub fn is_uploading(&self, key: &FieldKey) -> bool {
        self.uploads.is_in_flight(key)
    }

    /// Name of the collaborator call currently awaited outside the session lock.
    pub fn pending_call(&self) -> Option<&'static str> {
        self.pending_call.as_ref().map(|call| call.operation)
    }

    /// Serializes whole submit attempts on this session, including the
    /// idempotency lookup that precedes them.
    pub fn submit_gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.submit_gate.clone()
    }

    // ---- stage 1: collection and overlays ----

    /// Validates the request and hands back the collector call. The session
    /// accepts no other collaborator call until `finish_collect` runs.
    pub fn begin_collect(&mut self, source_url: &str) -> Result<CollectCall, WizardError> {
        self.ensure_stage("collect", &[Stage::Collecting])?;
        if self.source_product.is_some() {
            return Err(WizardError::AlreadyCollected);
        }
        let url = source_url.trim();
        if !is_http_url(url) {
            return Err(CollectionError::InvalidUrl(url.to_string()).into());
        }
        let ticket = self.start_call("collect")?;
        Ok(CollectCall {
            ticket,
            url: url.to_string(),
            collector: self.services.collector.clone(),
        })
    }

    pub fn finish_collect(&mut self, done: CollectDone) -> Result<(), WizardError> {
        self.end_call("collect", done.ticket)?;
        crate::metrics::collaborator_elapsed("collect", done.elapsed_ms);
        let product = done.result.map_err(|err| self.fail("collect", err.into()))?;
        let groups = merge(&self.catalog.layout, &product, None, None)
            .map_err(|err| self.fail("collect", err.into()))?;

        self.skus = product.skus.iter().map(sku_from_collected).collect();
        self.field_groups = groups;
        self.last_error = None;
        info!(
            target = "wizard.session",
            session = %self.id,
            source_url = %done.url,
            skus = self.skus.len(),
            "listing collected"
        );
        self.record(
            "collect",
            json!({
                "source_url": done.url,
                "title": product.title,
                "skus": product.skus.len(),
                "main_images": product.main_images.len(),
                "detail_images": product.detail_images.len(),
            }),
        );
        self.source_product = Some(product);
        Ok(())
    }

    pub fn begin_match(&mut self, datasource_id: &str) -> Result<MatchCall, WizardError> {
        self.ensure_overlay_stage("match_datasource")?;
        let Some(product) = self.source_product.clone() else {
            return Err(WizardError::NotCollected);
        };
        let ticket = self.start_call("match_datasource")?;
        Ok(MatchCall {
            ticket,
            datasource_id: datasource_id.to_string(),
            product,
            matcher: self.services.matcher.clone(),
        })
    }

    /// Applies a match result. A failed match clears the selection together
    /// with the overlay it had applied.
    pub fn finish_match(&mut self, done: MatchDone) -> Result<(), WizardError> {
        self.end_call("match_datasource", done.ticket)?;
        crate::metrics::collaborator_elapsed("match_datasource", done.elapsed_ms);
        self.ensure_overlay_stage("match_datasource")?;

        match done.result {
            Ok(fields) => {
                let count = fields.len();
                let previous = self.matched_fields.replace(fields);
                if let Err(err) = self.remerge() {
                    self.matched_fields = previous;
                    return Err(self.fail("match_datasource", err));
                }
                self.datasource_id = Some(done.datasource_id.clone());
                self.last_error = None;
                self.record(
                    "match_datasource",
                    json!({"datasource_id": done.datasource_id, "fields": count}),
                );
                Ok(())
            }
            Err(err) => {
                self.datasource_id = None;
                if self.matched_fields.take().is_some() {
                    self.drop_overlay("match_datasource");
                }
                Err(self.fail("match_datasource", err.into()))
            }
        }
    }

    pub fn clear_datasource(&mut self) -> Result<(), WizardError> {
        self.ensure_overlay_stage("clear_datasource")?;
        if self.pending_call() == Some("match_datasource") {
            self.pending_call = None;
        }
        self.datasource_id = None;
        self.matched_fields = None;
        if self.source_product.is_some() {
            self.remerge()?;
        }
        self.record("clear_datasource", json!({}));
        Ok(())
    }

    pub fn apply_template(&mut self, template_id: &str) -> Result<(), WizardError> {
        self.ensure_overlay_stage("apply_template")?;
        if self.source_product.is_none() {
            return Err(WizardError::NotCollected);
        }
        match self.services.templates.apply_template(template_id) {
            Ok(fields) => {
                let count = fields.len();
                let previous = self.template_fields.replace(fields);
                if let Err(err) = self.remerge() {
                    self.template_fields = previous;
                    return Err(self.fail("apply_template", err));
                }
                self.template_id = Some(template_id.to_string());
                self.last_error = None;
                self.record("apply_template", json!({"template_id": template_id, "fields": count}));
                Ok(())
            }
            Err(err) => {
                self.template_id = None;
                if self.template_fields.take().is_some() {
                    self.drop_overlay("apply_template");
                }
                Err(self.fail("apply_template", err.into()))
            }
        }
    }

    pub fn clear_template(&mut self) -> Result<(), WizardError> {
        self.ensure_overlay_stage("clear_template")?;
        self.template_id = None;
        self.template_fields = None;
        if self.source_product.is_some() {
            self.remerge()?;
        }
        self.record("clear_template", json!({}));
        Ok(())
    }

    /// Re-merges after an overlay was removed because its selection failed.
    fn drop_overlay(&mut self, operation: &'static str) {
        if let Err(err) = self.remerge() {
            warn!(
                target = "wizard.session",
                session = %self.id,
                operation,
                error = %err,
                "re-merge after dropping overlay failed"
            );
        }
    }

    fn remerge(&mut self) -> Result<(), WizardError> {
        let Some(product) = self.source_product.as_ref() else {
            return Err(WizardError::NotCollected);
        };
        let mut next = merge(
            &self.catalog.layout,
            product,
            self.matched_fields.as_deref(),
            self.template_fields.as_deref(),
        )?;
        carry_forward(&self.field_groups, &mut next);
        self.field_groups = next;
        Ok(())
    }

    // ---- stage 2: category ----

    pub fn select_category(&mut self, path: Vec<String>) -> Result<(), WizardError> {
        self.ensure_stage("select_category", &[Stage::Categorizing])?;
        if !self.catalog.category_exists(&path) {
            return Err(WizardError::UnknownCategory(path.join(" > ")));
        }
        self.record("select_category", json!({"path": path}));
        self.category_path = path;
        Ok(())
    }

    // ---- stage 3: field review and uploads ----

    pub fn edit_field(&mut self, group_id: &str, name: &str, value: &str) -> Result<(), WizardError> {
        self.ensure_stage(
            "edit_field",
            &[Stage::Collecting, Stage::Categorizing, Stage::FieldReview],
        )?;
        let field = self.text_field_mut(group_id, name)?;
        let value = value.trim();
        field.value = value.to_string();
        field.source = FieldSource::Manual;
        field.last_error = None;
        field.status = match (value.is_empty(), field.required) {
            (false, _) => FieldStatus::Completed,
            (true, true) => FieldStatus::Pending,
            (true, false) => FieldStatus::Optional,
        };
        let status = field.status;
        self.record(
            "edit_field",
            json!({"group_id": group_id, "name": name, "status": status}),
        );
        Ok(())
    }

    /// Accepts the current value of a text field as-is.
    pub fn confirm_field(&mut self, group_id: &str, name: &str) -> Result<(), WizardError> {
        self.ensure_stage(
            "confirm_field",
            &[Stage::Collecting, Stage::Categorizing, Stage::FieldReview],
        )?;
        let field = self.text_field_mut(group_id, name)?;
        if field.value.trim().is_empty() {
            return Err(WizardError::EmptyField(name.to_string()));
        }
        field.status = FieldStatus::Completed;
        self.record("confirm_field", json!({"group_id": group_id, "name": name}));
        Ok(())
    }

    fn text_field_mut(&mut self, group_id: &str, name: &str) -> Result<&mut Field, WizardError> {
        self.ensure_open()?;
        let field = find_field_mut(&mut self.field_groups, group_id, name).ok_or_else(|| {
            WizardError::UnknownField {
                group_id: group_id.to_string(),
                name: name.to_string(),
            }
        })?;
        if field.is_asset() {
            return Err(WizardError::NotEditable(name.to_string()));
        }
        Ok(field)
    }

    pub fn select_folder(&mut self, folder_id: &str) -> Result<&FolderSelection, WizardError> {
        self.ensure_stage(
            "select_folder",
            &[Stage::Collecting, Stage::Categorizing, Stage::FieldReview],
        )?;
        self.uploads.check_folder(folder_id)?;
        let selection = self
            .uploads
            .folders()
            .selection(folder_id)
            .ok_or_else(|| UploadError::UnknownFolder(folder_id.to_string()))?;
        self.record("select_folder", json!({"folder_id": folder_id, "path": selection.path}));
        Ok(self.folder.insert(selection))
    }

    pub fn begin_upload(&mut self, group_id: &str, name: &str) -> Result<UploadHandle, WizardError> {
        self.ensure_stage("begin_upload", &[Stage::FieldReview])?;
        let folder_id = self.selected_folder_id()?;
        let product = self.source_product.as_ref();
        let handle = self.uploads.begin_upload(
            &mut self.field_groups,
            FieldKey::new(group_id, name),
            &folder_id,
            |field| asset_sources(product, field),
        )?;
        self.record("begin_upload", json!({"field": handle.key, "folder_id": folder_id}));
        Ok(handle)
    }

    pub fn begin_upload_all(&mut self) -> Result<Vec<UploadHandle>, WizardError> {
        self.ensure_stage("begin_upload_all", &[Stage::FieldReview])?;
        let folder_id = self.selected_folder_id()?;
        let product = self.source_product.as_ref();
        let handles = self.uploads.begin_upload_all(
            &mut self.field_groups,
            &folder_id,
            |field| asset_sources(product, field),
        )?;
        let fields: Vec<&FieldKey> = handles.iter().map(|handle| &handle.key).collect();
        let output = json!({"fields": fields, "folder_id": folder_id});
        self.record("begin_upload_all", output);
        Ok(handles)
    }

    /// Writes a resolved upload into its field. Abandoned or superseded
    /// uploads come back as `Applied::Discarded` and change nothing.
    pub fn apply_upload(&mut self, outcome: UploadOutcome) -> Applied {
        let key = outcome.key.clone();
        let error = outcome.result.as_ref().err().map(ToString::to_string);
        let applied = self.uploads.apply(&mut self.field_groups, outcome);
        if applied != Applied::Discarded {
            self.record(
                "upload_finished",
                json!({"field": key, "applied": applied, "error": error}),
            );
        }
        applied
    }

    fn selected_folder_id(&self) -> Result<String, WizardError> {
        self.folder
            .as_ref()
            .map(|folder| folder.id.clone())
            .ok_or(WizardError::NoFolderSelected)
    }

    // ---- stage 4: pricing ----

    pub fn select_strategy(&mut self, strategy_id: &str) -> Result<(), WizardError> {
        self.ensure_stage("select_strategy", &[Stage::SkuPricing])?;
        self.pricing.select(strategy_id, &mut self.skus)?;
        self.record("select_strategy", json!({"strategy_id": strategy_id}));
        Ok(())
    }

    pub fn set_price_mode(&mut self, mode: PriceMode) -> Result<(), WizardError> {
        self.ensure_stage("set_price_mode", &[Stage::SkuPricing])?;
        self.pricing.set_mode(mode);
        self.record(
            "set_price_mode",
            json!({"mode": mode, "strategy_id": self.pricing.strategy_id}),
        );
        Ok(())
    }

    pub fn update_sku(&mut self, sku_id: &str, patch: SkuPatch) -> Result<&Sku, WizardError> {
        self.ensure_stage("update_sku", &[Stage::SkuPricing])?;
        if patch.price.is_some_and(|price| price < Decimal::ZERO) {
            return Err(PricingError::NegativePrice.into());
        }
        let index = self
            .skus
            .iter()
            .position(|sku| sku.id == sku_id)
            .ok_or_else(|| PricingError::UnknownSku(sku_id.to_string()))?;
        let sku = &mut self.skus[index];
        if let Some(name) = patch.name {
            sku.name = name;
        }
        if let Some(code) = patch.merchant_code {
            sku.merchant_code = code;
        }
        if let Some(code) = patch.external_code {
            sku.external_code = code;
        }
        if let Some(price) = patch.price {
            sku.price = Some(price);
        }
        if let Some(stock) = patch.stock {
            sku.stock = Some(stock);
        }
        if let Some(enabled) = patch.enabled {
            sku.enabled = enabled;
        }
        if let Some(barcode) = patch.barcode {
            sku.barcode = barcode;
        }
        if let Some(weight) = patch.net_weight {
            sku.net_weight = weight;
        }
        self.record("update_sku", json!({"sku_id": sku_id}));
        Ok(&self.skus[index])
    }

    // ---- stage 5: submission ----

    pub fn set_upload_mode(
        &mut self,
        mode: UploadMode,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), WizardError> {
        self.ensure_stage("set_upload_mode", &[Stage::SkuPricing, Stage::Submitting])?;
        self.ensure_idle()?;
        match (mode, scheduled_at) {
            (UploadMode::Scheduled, None) => {
                return Err(WizardError::Schedule(
                    "scheduled uploads need a scheduled_at time".into(),
                ));
            }
            (UploadMode::Scheduled, Some(at)) if at <= Utc::now() => {
                return Err(WizardError::Schedule(
                    "scheduled_at must be in the future".into(),
                ));
            }
            (UploadMode::Immediate | UploadMode::Warehouse, Some(_)) => {
                return Err(WizardError::Schedule(
                    "scheduled_at is only accepted for scheduled uploads".into(),
                ));
            }
            _ => {}
        }
        self.upload_mode = mode;
        self.scheduled_at = scheduled_at;
        self.pending_payload = None;
        self.record(
            "set_upload_mode",
            json!({"mode": mode, "scheduled_at": scheduled_at}),
        );
        Ok(())
    }

    /// Sends the listing to the marketplace. A failed submission keeps the
    /// built payload so a retry sends exactly the same listing.
    /// Checks readiness and hands back the marketplace call. The payload is
    /// built once and reused by every retry until the session changes it.
    pub fn begin_submit(&mut self) -> Result<SubmitCall, WizardError> {
        self.ensure_stage("submit", &[Stage::Submitting])?;
        let blocking: Vec<&'static str> = self
            .checks()
            .into_iter()
            .filter(CheckResult::blocks)
            .map(|check| check.label)
            .collect();
        if !blocking.is_empty() {
            return Err(WizardError::NotReady(blocking.join(", ")));
        }

        let payload = match &self.pending_payload {
            Some(payload) => payload.clone(),
            None => {
                let payload = self.build_payload()?;
                self.pending_payload = Some(payload.clone());
                payload
            }
        };
        let ticket = self.start_call("submit")?;
        Ok(SubmitCall {
            ticket,
            payload,
            mode: self.upload_mode,
            scheduled_at: self.scheduled_at,
            marketplace: self.services.marketplace.clone(),
        })
    }

    pub fn finish_submit(&mut self, done: SubmitDone) -> Result<SubmissionReceipt, WizardError> {
        self.end_call("submit", done.ticket)?;
        crate::metrics::collaborator_elapsed("submit", done.elapsed_ms);

        match done.result {
            Ok(receipt) => {
                info!(
                    target = "wizard.session",
                    session = %self.id,
                    item_id = %receipt.item_id,
                    "listing submitted"
                );
                self.submission = SubmissionState::Submitted {
                    receipt: receipt.clone(),
                };
                self.pending_payload = None;
                self.last_error = None;
                self.record("submit", json!({"receipt": receipt}));
                Ok(receipt)
            }
            Err(err) => {
                self.submission = SubmissionState::Failed {
                    error: err.to_string(),
                };
                Err(self.fail("submit", err.into()))
            }
        }
    }

    fn build_payload(&self) -> Result<ListingPayload, WizardError> {
        let product = self.source_product.as_ref().ok_or(WizardError::NotCollected)?;
        Ok(ListingPayload {
            source_url: product.source_url.clone(),
            title: self.listing_title(product),
            category_path: self.category_path.clone(),
            folder_id: self.folder.as_ref().map(|folder| folder.id.clone()),
            field_groups: self.field_groups.clone(),
            skus: self.skus.clone(),
        })
    }

    fn listing_title(&self, product: &CollectedProduct) -> String {
        self.catalog
            .layout
            .groups
            .iter()
            .find_map(|group| {
                let rule = group.fields.iter().find(|rule| rule.title)?;
                self.field(&group.id, &rule.name)
            })
            .map(|field| field.value.clone())
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| product.title.clone())
    }

    // ---- navigation ----

    pub fn checks(&self) -> Vec<CheckResult> {
        validator::validate(self.listing_view())
    }

    pub fn can_submit(&self) -> bool {
        validator::can_submit(self.listing_view())
    }

    fn listing_view(&self) -> ListingView<'_> {
        ListingView {
            field_groups: &self.field_groups,
            skus: &self.skus,
        }
    }

    pub fn advance(&mut self) -> Result<Stage, WizardError> {
        self.ensure_open()?;
        self.ensure_idle()?;
        let from = self.stage;
        let Some(to) = from.next() else {
            return Err(WizardError::WrongStage {
                operation: "advance",
                stage: from,
            });
        };
        if let Err(reason) = self.guard(from) {
            warn!(
                target = "wizard.session",
                session = %self.id,
                stage = %from,
                reason = %reason,
                "advance rejected"
            );
            return Err(WizardError::Guard { stage: from, reason });
        }
        if to == Stage::SkuPricing {
            self.backfill_external_codes();
        }
        self.move_to(to);
        Ok(to)
    }

    fn guard(&self, from: Stage) -> Result<(), String> {
        let failing = |checks: Vec<CheckResult>| -> Result<(), String> {
            let failed: Vec<String> = checks
                .iter()
                .filter(|check| check.blocks())
                .map(|check| format!("{} ({})", check.label, check.detail))
                .collect();
            if failed.is_empty() {
                Ok(())
            } else {
                Err(failed.join(", "))
            }
        };
        match from {
            Stage::Collecting if self.source_product.is_none() => {
                Err("no source listing collected".into())
            }
            Stage::Categorizing if self.category_path.is_empty() => {
                Err("no category selected".into())
            }
            Stage::FieldReview => {
                if self.uploads.in_flight_count() > 0 {
                    return Err(format!(
                        "{} upload(s) still in progress",
                        self.uploads.in_flight_count()
                    ));
                }
                failing(vec![
                    validator::required_fields_completed(&self.field_groups),
                    validator::assets_uploaded(&self.field_groups),
                ])
            }
            Stage::SkuPricing => failing(vec![
                validator::pricing_filled(&self.skus),
                validator::sku_info_complete(&self.skus),
            ]),
            _ => Ok(()),
        }
    }

    /// Steps back one stage. Fields, SKUs and selections are kept; leaving
    /// field review abandons uploads still in flight.
    pub fn retreat(&mut self) -> Result<Stage, WizardError> {
        self.ensure_open()?;
        self.ensure_idle()?;
        let from = self.stage;
        let Some(to) = from.previous() else {
            return Err(WizardError::WrongStage {
                operation: "retreat",
                stage: from,
            });
        };
        if from == Stage::FieldReview {
            let abandoned = self.uploads.abandon_all(&mut self.field_groups);
            if abandoned > 0 {
                info!(target = "wizard.session", session = %self.id, abandoned, "uploads abandoned on retreat");
            }
        }
        if from == Stage::Submitting {
            self.pending_payload = None;
            self.submission = SubmissionState::NotSubmitted;
        }
        self.move_to(to);
        Ok(to)
    }

    /// Drops in-flight uploads before the session is discarded.
    pub fn abandon(&mut self) -> usize {
        self.pending_call = None;
        let abandoned = self.uploads.abandon_all(&mut self.field_groups);
        self.record("abandon", json!({"uploads_abandoned": abandoned}));
        abandoned
    }

    fn move_to(&mut self, to: Stage) {
        let from = self.stage;
        self.stage = to;
        crate::metrics::stage_transition(from.number(), to.number());
        info!(
            target = "wizard.session",
            session = %self.id,
            from = %from,
            to = %to,
            "stage changed"
        );
        self.record(
            if to > from { "advance" } else { "retreat" },
            json!({"from": from, "to": to}),
        );
    }

    fn backfill_external_codes(&mut self) {
        let Some(code) = all_fields(&self.field_groups)
            .find(|field| field.name == EXTERNAL_CODE_FIELD && field.is_completed())
            .map(|field| field.value.clone())
        else {
            return;
        };
        for sku in self
            .skus
            .iter_mut()
            .filter(|sku| sku.external_code.trim().is_empty())
        {
            sku.external_code = code.clone();
        }
    }

    fn start_call(&mut self, operation: &'static str) -> Result<Uuid, WizardError> {
        self.ensure_idle()?;
        let ticket = Uuid::new_v4();
        self.pending_call = Some(PendingCall { ticket, operation });
        Ok(ticket)
    }

    /// Releases the pending call if `ticket` still owns it.
    fn end_call(&mut self, operation: &'static str, ticket: Uuid) -> Result<(), WizardError> {
        match &self.pending_call {
            Some(call) if call.ticket == ticket => {
                self.pending_call = None;
                Ok(())
            }
            _ => {
                debug!(target = "wizard.session", session = %self.id, operation, "stale call result dropped");
                Err(WizardError::Superseded(operation))
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), WizardError> {
        match &self.pending_call {
            Some(call) => Err(WizardError::Busy(call.operation)),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), WizardError> {
        match self.submission {
            SubmissionState::Submitted { .. } => Err(WizardError::AlreadySubmitted),
            _ => Ok(()),
        }
    }

    fn ensure_stage(&self, operation: &'static str, allowed: &[Stage]) -> Result<(), WizardError> {
        self.ensure_open()?;
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(WizardError::WrongStage {
                operation,
                stage: self.stage,
            })
        }
    }

    fn ensure_overlay_stage(&self, operation: &'static str) -> Result<(), WizardError> {
        self.ensure_stage(
            operation,
            &[Stage::Collecting, Stage::Categorizing, Stage::FieldReview],
        )
    }

    fn fail(&mut self, operation: &'static str, err: WizardError) -> WizardError {
        warn!(
            target = "wizard.session",
            session = %self.id,
            operation,
            code = err.code(),
            error = %err,
            "operation failed"
        );
        self.last_error = Some(err.to_string());
        self.record(
            "error",
            json!({"operation": operation, "code": err.code(), "error": err.to_string()}),
        );
        err
    }

    fn record(&mut self, name: &str, output: serde_json::Value) {
        self.history
            .push(SessionEvent::new(name, self.stage.number(), output));
    }

    pub fn view(&self) -> SessionView<'_> {
        SessionView {
            id: self.id,
            created_at: self.created_at,
            stage: self.stage,
            stage_number: self.stage.number(),
            source_product: self.source_product.as_ref(),
            category_path: &self.category_path,
            datasource_id: self.datasource_id.as_deref(),
            template_id: self.template_id.as_deref(),
            field_groups: &self.field_groups,
            skus: self
                .skus
                .iter()
                .map(|sku| SkuView {
                    price_delta: price_delta(sku).map(|delta| delta.round_dp(1)),
                    sku,
                })
                .collect(),
            folder: self.folder.as_ref(),
            price_mode: self.pricing.mode,
            strategy_id: &self.pricing.strategy_id,
            upload_mode: self.upload_mode,
            scheduled_at: self.scheduled_at,
            uploads_in_flight: self.uploads.in_flight_keys(),
            pending_call: self.pending_call(),
            checks: self.checks(),
            can_submit: self.can_submit(),
            submission: &self.submission,
            last_error: self.last_error.as_deref(),
            history: &self.history,
        }
    }
}

#[derive(Serialize)]
pub struct SkuView<'a> {
    #[serde(flatten)]
    pub sku: &'a Sku,
    pub price_delta: Option<Decimal>,
}

/// Serializable snapshot of a session.
#[derive(Serialize)]
pub struct SessionView<'a> {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub stage: Stage,
    pub stage_number: u8,
    pub source_product: Option<&'a CollectedProduct>,
    pub category_path: &'a [String],
    pub datasource_id: Option<&'a str>,
    pub template_id: Option<&'a str>,
    pub field_groups: &'a [FieldGroup],
    pub skus: Vec<SkuView<'a>>,
    pub folder: Option<&'a FolderSelection>,
    pub price_mode: PriceMode,
    pub strategy_id: &'a str,
    pub upload_mode: UploadMode,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub uploads_in_flight: Vec<FieldKey>,
    pub pending_call: Option<&'static str>,
    pub checks: Vec<CheckResult>,
    pub can_submit: bool,
    pub submission: &'a SubmissionState,
    pub last_error: Option<&'a str>,
    pub history: &'a [SessionEvent],
}

fn is_http_url(raw: &str) -> bool {
    reqwest::Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

fn sku_from_collected(collected: &CollectedSku) -> Sku {
    Sku {
        id: collected.id.clone(),
        name: collected.name.clone(),
        merchant_code: collected.merchant_code.clone().unwrap_or_default(),
        external_code: String::new(),
        original_price: collected.price,
        price: None,
        stock: collected.stock,
        enabled: true,
        barcode: collected.barcode.clone().unwrap_or_default(),
        net_weight: collected.net_weight.clone().unwrap_or_default(),
    }
}

fn asset_sources(product: Option<&CollectedProduct>, field: &Field) -> Vec<String> {
    let (Some(product), Some(assets)) = (product, field.assets.as_ref()) else {
        return Vec::new();
    };
    match assets.origin {
        AssetOrigin::MainImages => product.main_images.clone(),
        AssetOrigin::DetailImages => product.detail_images.clone(),
        AssetOrigin::Video if product.has_video => vec![format!("{}#video", product.source_url)],
        AssetOrigin::Video | AssetOrigin::Generated => Vec::new(),
    }
}
