pub mod demo;
pub mod remote;

use crate::catalog::{Catalog, FolderSpec};
use crate::config::MARKETPLACE_SUBMIT_URL;
use crate::models::{
    CollectedProduct, Field, FieldKind, ListingPayload, SubmissionReceipt, UploadMode,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectionError {
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("collection failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("unknown datasource `{0}`")]
    UnknownDatasource(String),
    #[error("datasource match failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template `{0}`")]
    UnknownTemplate(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssetUploadError {
    #[error("asset upload failed: {0}")]
    Failed(String),
    #[error("only {uploaded} of {expected} assets were uploaded")]
    Partial { uploaded: u32, expected: u32 },
    #[error("upload abandoned before it finished")]
    Abandoned,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("marketplace rejected the listing: {0}")]
    Rejected(String),
    #[error("marketplace request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetPayload {
    pub field_name: String,
    pub kind: FieldKind,
    pub count: u32,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AssetUploadResult {
    pub uploaded_count: u32,
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, source_url: &str) -> Result<CollectedProduct, CollectionError>;
}

#[async_trait]
pub trait DatasourceMatcher: Send + Sync {
    /// Returns Matched-sourced fields for `product` from the given datasource.
    async fn match_fields(
        &self,
        datasource_id: &str,
        product: &CollectedProduct,
    ) -> Result<Vec<Field>, MatchError>;
}

/// Template fields are static per id, so applying is synchronous.
pub trait TemplateSource: Send + Sync {
    fn apply_template(&self, template_id: &str) -> Result<Vec<Field>, TemplateError>;
}

#[async_trait]
pub trait AssetLibrary: Send + Sync {
    async fn upload(
        &self,
        folder_id: &str,
        payload: AssetPayload,
    ) -> Result<AssetUploadResult, AssetUploadError>;

    async fn list_folders(&self) -> Result<Vec<FolderSpec>, AssetUploadError>;
}

#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn submit(
        &self,
        listing: &ListingPayload,
        mode: UploadMode,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<SubmissionReceipt, SubmissionError>;
}

/// The external collaborators a session talks to.
#[derive(Clone)]
pub struct Services {
    pub collector: Arc<dyn Collector>,
    pub matcher: Arc<dyn DatasourceMatcher>,
    pub templates: Arc<dyn TemplateSource>,
    pub assets: Arc<dyn AssetLibrary>,
    pub marketplace: Arc<dyn Marketplace>,
}

impl Services {
    pub fn demo(catalog: Arc<Catalog>) -> Self {
        Self {
            collector: Arc::new(demo::DemoCollector),
            matcher: Arc::new(demo::CatalogDatasources::new(catalog.clone())),
            templates: Arc::new(demo::CatalogTemplates::new(catalog.clone())),
            assets: Arc::new(demo::DemoAssetLibrary::new(catalog.folders.clone())),
            marketplace: Arc::new(demo::DemoMarketplace),
        }
    }

    /// Demo collaborators, with the marketplace swapped for the HTTP client
    /// when `MARKETPLACE_SUBMIT_URL` is configured.
    pub fn from_env(catalog: Arc<Catalog>) -> Self {
        let mut services = Self::demo(catalog);
        if let Some(url) = MARKETPLACE_SUBMIT_URL.as_deref() {
            info!(target = "wizard.services", submit_url = %url, "using http marketplace");
            services.marketplace = Arc::new(remote::HttpMarketplace::from_env(url));
        }
        services
    }
}
