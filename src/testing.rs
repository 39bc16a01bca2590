//! Fixtures and fake collaborators shared by the unit tests.

use crate::assets::Applied;
use crate::catalog::{Catalog, FolderSpec};
use crate::models::{
    CollectedProduct, CollectedSku, Field, ListingPayload, ListingStatus, Param, Sku,
    SubmissionReceipt, UploadMode,
};
use crate::services::{
    AssetLibrary, AssetPayload, AssetUploadError, AssetUploadResult, CollectionError, Collector,
    DatasourceMatcher, Marketplace, MatchError, Services, SubmissionError,
    demo::{CatalogDatasources, CatalogTemplates},
};
use crate::wizard::{SkuPatch, WizardError, WizardSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::Semaphore;

pub fn sample_collected() -> CollectedProduct {
    let params = [
        ("Origin", "Mainland China"),
        ("Brand", "September Poem"),
        ("Series", "Organic"),
        ("Item No.", "Black sesame"),
        ("Manufacturer", "Fengxiangyuan Foods"),
        ("Manufacturer address", "Binzhou, Shandong"),
        ("Manufacturer contact", "See package"),
        ("Production license", "SC10237162300022"),
        ("Ingredients", "Organic black sesame"),
        ("Shelf life", "365 days"),
    ]
    .into_iter()
    .map(|(name, value)| Param {
        name: name.into(),
        value: value.into(),
    })
    .collect();

    CollectedProduct {
        source_url: "https://item.taobao.com/item.htm?id=42".into(),
        title: "Organic black sesame 730g".into(),
        price: Some(Decimal::new(4931, 2)),
        original_price: Some(Decimal::new(5990, 2)),
        has_video: true,
        main_images: (1..=5).map(|n| format!("main-{n}.jpg")).collect(),
        detail_images: (1..=8).map(|n| format!("detail-{n}.jpg")).collect(),
        skus: vec![
            CollectedSku {
                id: "1".into(),
                name: "Black sesame 600g (roasted)".into(),
                price: Decimal::new(3990, 2),
                original_price: Some(Decimal::new(5500, 2)),
                stock: Some(10),
                merchant_code: Some("SKU001".into()),
                barcode: Some("6901234567".into()),
                net_weight: Some("600g".into()),
            },
            CollectedSku {
                id: "2".into(),
                name: "Black sesame 730g (raw)".into(),
                price: Decimal::new(4590, 2),
                original_price: None,
                stock: None,
                merchant_code: Some("SKU002".into()),
                barcode: None,
                net_weight: Some("730g".into()),
            },
        ],
        params,
        collected_at: Utc::now(),
    }
}

pub fn sample_skus() -> Vec<Sku> {
    vec![
        Sku {
            id: "1".into(),
            name: "Black sesame 600g (roasted)".into(),
            merchant_code: "SKU001".into(),
            external_code: "2490P18".into(),
            original_price: Decimal::new(3990, 2),
            price: None,
            stock: None,
            enabled: true,
            barcode: "6901234567".into(),
            net_weight: "600g".into(),
        },
        Sku {
            id: "2".into(),
            name: "Black sesame 730g (raw)".into(),
            merchant_code: "SKU002".into(),
            external_code: "2490P18".into(),
            original_price: Decimal::new(4590, 2),
            price: None,
            stock: None,
            enabled: true,
            barcode: String::new(),
            net_weight: "730g".into(),
        },
    ]
}

pub struct FixedCollector {
    pub product: Option<CollectedProduct>,
}

#[async_trait]
impl Collector for FixedCollector {
    async fn collect(&self, _source_url: &str) -> Result<CollectedProduct, CollectionError> {
        self.product
            .clone()
            .ok_or_else(|| CollectionError::Failed("page did not load".into()))
    }
}

/// Collector that holds every call until the test releases a permit.
pub struct GatedCollector {
    gate: Semaphore,
    inner: FixedCollector,
}

impl GatedCollector {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            inner: FixedCollector {
                product: Some(sample_collected()),
            },
        }
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl Collector for GatedCollector {
    async fn collect(&self, source_url: &str) -> Result<CollectedProduct, CollectionError> {
        self.gate
            .acquire()
            .await
            .map_err(|err| CollectionError::Failed(err.to_string()))?
            .forget();
        self.inner.collect(source_url).await
    }
}

pub struct FailingMatcher;

#[async_trait]
impl DatasourceMatcher for FailingMatcher {
    async fn match_fields(
        &self,
        _datasource_id: &str,
        _product: &CollectedProduct,
    ) -> Result<Vec<Field>, MatchError> {
        Err(MatchError::Failed("sheet unavailable".into()))
    }
}

/// Asset library whose uploads wait for permits released by the test.
pub struct GatedLibrary {
    gate: Option<Semaphore>,
    failing: Mutex<HashSet<String>>,
    short: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
    folders: Vec<FolderSpec>,
}

impl GatedLibrary {
    pub fn gated() -> Self {
        Self::with_gate(Some(Semaphore::new(0)))
    }

    pub fn open() -> Self {
        Self::with_gate(None)
    }

    fn with_gate(gate: Option<Semaphore>) -> Self {
        Self {
            gate,
            failing: Mutex::new(HashSet::new()),
            short: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            folders: Catalog::builtin().map(|c| c.folders).unwrap_or_default(),
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn fail_field(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal_field(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn short_field(&self, name: &str) {
        self.short.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl AssetLibrary for GatedLibrary {
    async fn upload(
        &self,
        _folder_id: &str,
        payload: AssetPayload,
    ) -> Result<AssetUploadResult, AssetUploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| AssetUploadError::Failed(err.to_string()))?
                .forget();
        }
        if self.failing.lock().unwrap().contains(&payload.field_name) {
            return Err(AssetUploadError::Failed("boom".into()));
        }
        let uploaded_count = if self.short.lock().unwrap().contains(&payload.field_name) {
            payload.count.saturating_sub(1)
        } else {
            payload.count
        };
        Ok(AssetUploadResult { uploaded_count })
    }

    async fn list_folders(&self) -> Result<Vec<FolderSpec>, AssetUploadError> {
        Ok(self.folders.clone())
    }
}

/// Marketplace that fails the first `failures` submissions and records payloads.
pub struct ScriptedMarketplace {
    failures: AtomicUsize,
    gate: Option<Semaphore>,
    pub submitted: Mutex<Vec<ListingPayload>>,
}

impl ScriptedMarketplace {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            gate: None,
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Succeeds, but only once the test releases a permit per call.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::failing(0)
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }
}

#[async_trait]
impl Marketplace for ScriptedMarketplace {
    async fn submit(
        &self,
        listing: &ListingPayload,
        mode: UploadMode,
        _scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        self.submitted.lock().unwrap().push(listing.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| SubmissionError::Transport(err.to_string()))?
                .forget();
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SubmissionError::Transport("connection reset".into()));
        }
        let status = match mode {
            UploadMode::Immediate => ListingStatus::Online,
            UploadMode::Scheduled => ListingStatus::Scheduled,
            UploadMode::Warehouse => ListingStatus::InWarehouse,
        };
        Ok(SubmissionReceipt {
            item_id: "ITEM-123456789".into(),
            status,
        })
    }
}

pub fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::builtin().expect("builtin catalog"))
}

pub fn test_services(
    library: Arc<GatedLibrary>,
    marketplace: Arc<ScriptedMarketplace>,
) -> Services {
    let catalog = catalog();
    Services {
        collector: Arc::new(FixedCollector {
            product: Some(sample_collected()),
        }),
        matcher: Arc::new(CatalogDatasources::new(catalog.clone())),
        templates: Arc::new(CatalogTemplates::new(catalog)),
        assets: library,
        marketplace,
    }
}

pub const SOURCE_URL: &str = "https://item.taobao.com/item.htm?id=42";

pub fn leaf_category() -> Vec<String> {
    ["Grain, Oil & Seasoning", "Rice, Flour & Grains", "Specialty Rice & Flour"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Collects, categorizes and selects the `grain-4` folder.
pub async fn to_field_review(session: &mut WizardSession) {
    session.collect(SOURCE_URL).await.expect("collect");
    session.advance().expect("1 -> 2");
    session.select_category(leaf_category()).expect("category");
    session.advance().expect("2 -> 3");
    session.select_folder("grain-4").expect("folder");
}

/// Fills or confirms every required text field that is not yet completed.
pub fn complete_required_text(session: &mut WizardSession) {
    session
        .edit_field("food_safety", "Organic code", "2490P1800146")
        .expect("organic code");
    let todo: Vec<(String, String, bool)> = session
        .field_groups()
        .iter()
        .flat_map(|group| {
            group
                .fields
                .iter()
                .filter(|f| f.required && !f.is_asset() && !f.is_completed())
                .map(|f| (group.id.clone(), f.name.clone(), f.value.is_empty()))
        })
        .collect();
    for (group, name, empty) in todo {
        if empty {
            session.edit_field(&group, &name, "filled").expect("edit");
        } else {
            session.confirm_field(&group, &name).expect("confirm");
        }
    }
}

pub async fn upload_everything(session: &mut WizardSession) {
    let handles = session.begin_upload_all().expect("upload all");
    for handle in handles {
        let outcome = handle.wait().await;
        assert_eq!(session.apply_upload(outcome), Applied::Completed);
    }
}

pub async fn to_pricing(session: &mut WizardSession) {
    to_field_review(session).await;
    complete_required_text(session);
    upload_everything(session).await;
    session.advance().expect("3 -> 4");
}

pub async fn to_submitting(session: &mut WizardSession) {
    to_pricing(session).await;
    session.select_strategy("up_10").expect("strategy");
    session
        .update_sku(
            "2",
            SkuPatch {
                barcode: Some("6901234567891".into()),
                ..SkuPatch::default()
            },
        )
        .expect("sku patch");
    session.advance().expect("4 -> 5");
}

/// Collaborator calls run inline with the session borrowed for the whole call.
impl WizardSession {
    pub async fn collect(&mut self, source_url: &str) -> Result<(), WizardError> {
        let done = self.begin_collect(source_url)?.run().await;
        self.finish_collect(done)
    }

    pub async fn match_datasource(&mut self, datasource_id: &str) -> Result<(), WizardError> {
        let done = self.begin_match(datasource_id)?.run().await;
        self.finish_match(done)
    }

    pub async fn submit(&mut self) -> Result<SubmissionReceipt, WizardError> {
        let done = self.begin_submit()?.run().await;
        self.finish_submit(done)
    }
}
