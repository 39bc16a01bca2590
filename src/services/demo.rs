use super::{
    AssetLibrary, AssetPayload, AssetUploadError, AssetUploadResult, CollectionError, Collector,
    DatasourceMatcher, Marketplace, MatchError, SubmissionError, TemplateError, TemplateSource,
};
use crate::catalog::{Catalog, FolderSpec, NamedValue};
use crate::config::DEMO_UPLOAD_LATENCY_MS;
use crate::models::{
    CollectedProduct, CollectedSku, Field, FieldSource, FieldStatus, ListingPayload, ListingStatus,
    Param, SubmissionReceipt, UploadMode,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rust_decimal::Decimal;
use std::{
    collections::hash_map::DefaultHasher,
    future::Future,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::time::{Duration, sleep};
use uuid::Uuid;

/// Returns the same sample listing for every source url.
pub struct DemoCollector;

#[async_trait]
impl Collector for DemoCollector {
    async fn collect(&self, source_url: &str) -> Result<CollectedProduct, CollectionError> {
        short_pause(25).await;
        Ok(sample_product(source_url))
    }
}

fn sample_product(source_url: &str) -> CollectedProduct {
    let params = [
        ("Origin", "Mainland China"),
        ("Brand", "September Poem"),
        ("Production date", "2025-08-23 to 2025-11-17"),
        ("Series", "Organic"),
        ("Spec", "730g"),
        ("Item No.", "Black sesame"),
        ("Packaging", "Jar"),
        ("Product name", "Organic black sesame"),
        ("Net content", "730g"),
        ("City", "Binzhou"),
        ("Province", "Shandong"),
        ("Production license", "SC10237162300022"),
        ("Product standard", "GB/T11761"),
        ("Manufacturer", "Shandong Fengxiangyuan Foods Co., Ltd."),
        ("Manufacturer address", "168 Haifeng 11th Rd, Wudi County, Binzhou"),
        ("Manufacturer contact", "See package"),
        ("Ingredients", "Organic black sesame"),
        ("Storage", "Keep sealed in a cool, dry, ventilated place"),
        ("Shelf life", "365 days"),
    ]
    .into_iter()
    .map(|(name, value)| Param {
        name: name.to_string(),
        value: value.to_string(),
    })
    .collect();

    let skus = [
        ("1", "(Raw) Organic black sesame 730g x1 jar", 4931, 5990, "730g"),
        ("2", "(Roasted) Organic black sesame 600g x1 jar", 4580, 5500, "600g"),
        ("3", "Raw black sesame 730g + organic black beans 800g", 7990, 9900, "1530g"),
    ]
    .into_iter()
    .map(|(id, name, price, original, weight)| CollectedSku {
        id: id.to_string(),
        name: name.to_string(),
        price: Decimal::new(price, 2),
        original_price: Some(Decimal::new(original, 2)),
        stock: None,
        merchant_code: None,
        barcode: None,
        net_weight: Some(weight.to_string()),
    })
    .collect();

    CollectedProduct {
        source_url: source_url.to_string(),
        title: "September Poem organic black sesame 730g x1 jar, raw or roasted".to_string(),
        price: Some(Decimal::new(4931, 2)),
        original_price: Some(Decimal::new(5990, 2)),
        has_video: true,
        main_images: (1..=5)
            .map(|n| format!("{source_url}#main-{n}"))
            .collect(),
        detail_images: (1..=8)
            .map(|n| format!("{source_url}#detail-{n}"))
            .collect(),
        skus,
        params,
        collected_at: Utc::now(),
    }
}

/// Matches against the fixed field values configured for each datasource.
pub struct CatalogDatasources {
    catalog: Arc<Catalog>,
}

impl CatalogDatasources {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl DatasourceMatcher for CatalogDatasources {
    async fn match_fields(
        &self,
        datasource_id: &str,
        _product: &CollectedProduct,
    ) -> Result<Vec<Field>, MatchError> {
        short_pause(15).await;
        let datasource = self
            .catalog
            .datasource(datasource_id)
            .ok_or_else(|| MatchError::UnknownDatasource(datasource_id.to_string()))?;
        Ok(overlay_fields(&datasource.fields, FieldSource::Matched))
    }
}

pub struct CatalogTemplates {
    catalog: Arc<Catalog>,
}

impl CatalogTemplates {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }
}

impl TemplateSource for CatalogTemplates {
    fn apply_template(&self, template_id: &str) -> Result<Vec<Field>, TemplateError> {
        let template = self
            .catalog
            .template(template_id)
            .ok_or_else(|| TemplateError::UnknownTemplate(template_id.to_string()))?;
        Ok(overlay_fields(&template.fields, FieldSource::Template))
    }
}

fn overlay_fields(values: &[NamedValue], source: FieldSource) -> Vec<Field> {
    values
        .iter()
        .map(|entry| {
            Field::text(
                entry.name.clone(),
                entry.value.clone(),
                source,
                FieldStatus::Completed,
                false,
            )
        })
        .collect()
}

/// In-memory asset library that accepts uploads after a short, jittered delay.
pub struct DemoAssetLibrary {
    folders: Vec<FolderSpec>,
    latency_ms: u64,
}

impl DemoAssetLibrary {
    pub fn new(folders: Vec<FolderSpec>) -> Self {
        Self {
            folders,
            latency_ms: *DEMO_UPLOAD_LATENCY_MS,
        }
    }

    fn has_folder(&self, id: &str) -> bool {
        fn walk(nodes: &[FolderSpec], id: &str) -> bool {
            nodes
                .iter()
                .any(|node| node.id == id || walk(&node.children, id))
        }
        walk(&self.folders, id)
    }
}

#[async_trait]
impl AssetLibrary for DemoAssetLibrary {
    async fn upload(
        &self,
        folder_id: &str,
        payload: AssetPayload,
    ) -> Result<AssetUploadResult, AssetUploadError> {
        if !self.has_folder(folder_id) {
            return Err(AssetUploadError::Failed(format!(
                "unknown folder `{folder_id}`"
            )));
        }
        let mut hasher = DefaultHasher::new();
        payload.field_name.hash(&mut hasher);
        folder_id.hash(&mut hasher);
        let mut rng = SmallRng::seed_from_u64(hasher.finish());
        let jitter = rng.random_range(0..=self.latency_ms / 2);
        short_pause(self.latency_ms + jitter).await;
        Ok(AssetUploadResult {
            uploaded_count: payload.count,
        })
    }

    async fn list_folders(&self) -> Result<Vec<FolderSpec>, AssetUploadError> {
        Ok(self.folders.clone())
    }
}

pub struct DemoMarketplace;

#[async_trait]
impl Marketplace for DemoMarketplace {
    async fn submit(
        &self,
        listing: &ListingPayload,
        mode: UploadMode,
        _scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        short_pause(30).await;
        if listing.skus.iter().all(|sku| !sku.enabled) {
            return Err(SubmissionError::Rejected("no enabled sku".into()));
        }
        let status = match mode {
            UploadMode::Immediate => ListingStatus::Online,
            UploadMode::Scheduled => ListingStatus::Scheduled,
            UploadMode::Warehouse => ListingStatus::InWarehouse,
        };
        Ok(SubmissionReceipt {
            item_id: format!("ITEM-{}", Uuid::new_v4().simple()),
            status,
        })
    }
}

fn short_pause(ms: u64) -> impl Future<Output = ()> {
    sleep(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::builtin().unwrap())
    }

    #[tokio::test]
    async fn collector_returns_complete_listing() {
        let product = DemoCollector
            .collect("https://item.taobao.com/item.htm?id=1")
            .await
            .expect("collect");
        assert!(!product.title.is_empty());
        assert!(product.price.is_some());
        assert_eq!(product.main_images.len(), 5);
        assert_eq!(product.detail_images.len(), 8);
        assert_eq!(product.skus.len(), 3);
    }

    #[tokio::test]
    async fn datasource_match_tags_fields_as_matched() {
        let matcher = CatalogDatasources::new(catalog());
        let product = sample_product("https://example.com/p");
        let fields = matcher.match_fields("ds1", &product).await.unwrap();
        assert!(!fields.is_empty());
        assert!(fields.iter().all(|f| f.source == FieldSource::Matched));
        assert_eq!(
            matcher.match_fields("ds9", &product).await,
            Err(MatchError::UnknownDatasource("ds9".into()))
        );
    }

    #[test]
    fn template_apply_is_idempotent() {
        let templates = CatalogTemplates::new(catalog());
        let first = templates.apply_template("t1").unwrap();
        let second = templates.apply_template("t1").unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|f| f.source == FieldSource::Template));
        assert!(templates.apply_template("t404").is_err());
    }

    #[tokio::test]
    async fn asset_library_rejects_unknown_folder() {
        let library = DemoAssetLibrary {
            folders: catalog().folders.clone(),
            latency_ms: 0,
        };
        let payload = AssetPayload {
            field_name: "Main images 1:1".into(),
            kind: crate::models::FieldKind::Image,
            count: 5,
            sources: vec![],
        };
        let ok = library.upload("grain-4", payload.clone()).await.unwrap();
        assert_eq!(ok.uploaded_count, 5);
        assert!(library.upload("nowhere", payload).await.is_err());
    }
}
