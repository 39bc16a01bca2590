use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Collected,
    Matched,
    Template,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Completed,
    Pending,
    NeedsGeneration,
    Optional,
    Uploading,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Image,
    Video,
}

impl FieldKind {
    pub fn is_asset(&self) -> bool {
        matches!(self, FieldKind::Image | FieldKind::Video)
    }
}

/// Where the payload of an asset field is taken from when it is uploaded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetOrigin {
    MainImages,
    DetailImages,
    Video,
    Generated,
}

/// Upload progress of an image or video field. `uploaded` never exceeds `target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetProgress {
    pub origin: AssetOrigin,
    target: u32,
    uploaded: u32,
}

impl AssetProgress {
    pub fn new(origin: AssetOrigin, target: u32) -> Self {
        Self {
            origin,
            target,
            uploaded: 0,
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn uploaded(&self) -> u32 {
        self.uploaded
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded == self.target
    }

    pub fn mark_complete(&mut self) {
        self.uploaded = self.target;
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub value: String,
    pub source: FieldSource,
    pub status: FieldStatus,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub assets: Option<AssetProgress>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Field {
    pub fn text(
        name: impl Into<String>,
        value: impl Into<String>,
        source: FieldSource,
        status: FieldStatus,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            source,
            status,
            required,
            kind: FieldKind::Text,
            assets: None,
            last_error: None,
        }
    }

    pub fn asset(
        name: impl Into<String>,
        kind: FieldKind,
        origin: AssetOrigin,
        target: u32,
        status: FieldStatus,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            value: pending_upload_label(target),
            source: FieldSource::Collected,
            status,
            required,
            kind,
            assets: Some(AssetProgress::new(origin, target)),
            last_error: None,
        }
    }

    pub fn is_asset(&self) -> bool {
        self.kind.is_asset()
    }

    pub fn is_completed(&self) -> bool {
        self.status == FieldStatus::Completed
    }

    pub fn target_asset_count(&self) -> Option<u32> {
        self.assets.as_ref().map(AssetProgress::target)
    }

    pub fn uploaded_asset_count(&self) -> Option<u32> {
        self.assets.as_ref().map(AssetProgress::uploaded)
    }

    /// Asset fields are fully uploaded when every target asset landed; text
    /// fields trivially satisfy this.
    pub fn assets_uploaded(&self) -> bool {
        self.assets.as_ref().is_none_or(AssetProgress::is_complete)
    }
}

pub fn pending_upload_label(count: u32) -> String {
    format!("{count} pending upload")
}

pub fn uploaded_label(count: u32) -> String {
    format!("{count} uploaded")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldGroup {
    pub id: String,
    pub title: String,
    pub fields: Vec<Field>,
}

impl FieldGroup {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|field| field.name == name)
    }

    /// Inserts `field`, replacing an existing field of the same name in place.
    pub fn upsert(&mut self, field: Field) {
        match self.field_mut(&field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }
}

pub fn find_field<'a>(groups: &'a [FieldGroup], group_id: &str, name: &str) -> Option<&'a Field> {
    groups
        .iter()
        .find(|group| group.id == group_id)
        .and_then(|group| group.field(name))
}

pub fn find_field_mut<'a>(
    groups: &'a mut [FieldGroup],
    group_id: &str,
    name: &str,
) -> Option<&'a mut Field> {
    groups
        .iter_mut()
        .find(|group| group.id == group_id)
        .and_then(|group| group.field_mut(name))
}

pub fn all_fields(groups: &[FieldGroup]) -> impl Iterator<Item = &Field> {
    groups.iter().flat_map(|group| group.fields.iter())
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sku {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub merchant_code: String,
    #[serde(default)]
    pub external_code: String,
    pub original_price: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stock: Option<u32>,
    pub enabled: bool,
    #[serde(default)]
    pub barcode: String,
    #[serde(default)]
    pub net_weight: String,
}

impl Sku {
    pub fn info_complete(&self) -> bool {
        [
            &self.name,
            &self.merchant_code,
            &self.external_code,
            &self.barcode,
            &self.net_weight,
        ]
        .iter()
        .all(|value| !value.trim().is_empty())
    }

    pub fn price_filled(&self) -> bool {
        self.price.is_some_and(|price| price >= Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectedSku {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    #[serde(default)]
    pub original_price: Option<Decimal>,
    #[serde(default)]
    pub stock: Option<u32>,
    #[serde(default)]
    pub merchant_code: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub net_weight: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectedProduct {
    pub source_url: String,
    pub title: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub original_price: Option<Decimal>,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default)]
    pub main_images: Vec<String>,
    #[serde(default)]
    pub detail_images: Vec<String>,
    #[serde(default)]
    pub skus: Vec<CollectedSku>,
    #[serde(default)]
    pub params: Vec<Param>,
    pub collected_at: DateTime<Utc>,
}

impl CollectedProduct {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|param| param.name == name)
            .map(|param| param.value.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    Fixed,
    #[default]
    Strategy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    Immediate,
    Scheduled,
    #[default]
    Warehouse,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Online,
    Scheduled,
    InWarehouse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub item_id: String,
    pub status: ListingStatus,
}

/// Everything the marketplace receives for one listing.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingPayload {
    pub source_url: String,
    pub title: String,
    pub category_path: Vec<String>,
    pub folder_id: Option<String>,
    pub field_groups: Vec<FieldGroup>,
    pub skus: Vec<Sku>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub name: String,
    pub stage: u8,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl SessionEvent {
    pub fn new(name: &str, stage: u8, output: Value) -> Self {
        Self {
            name: name.to_string(),
            stage,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
