use crate::models::{FieldGroup, FieldStatus, Sku, all_fields};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    RequiredFieldsCompleted,
    AssetsUploaded,
    SkuInfoComplete,
    PricingFilled,
    OptionalFieldsPending,
}

impl CheckKind {
    pub fn label(&self) -> &'static str {
        match self {
            CheckKind::RequiredFieldsCompleted => "required fields completed",
            CheckKind::AssetsUploaded => "assets uploaded",
            CheckKind::SkuInfoComplete => "sku info complete",
            CheckKind::PricingFilled => "prices filled",
            CheckKind::OptionalFieldsPending => "optional fields completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckResult {
    pub check: CheckKind,
    pub label: &'static str,
    pub passed: bool,
    /// Optional checks are advisory and never block submission.
    pub optional: bool,
    pub detail: String,
}

impl CheckResult {
    fn new(check: CheckKind, passed: bool, optional: bool, detail: String) -> Self {
        Self {
            check,
            label: check.label(),
            passed,
            optional,
            detail,
        }
    }

    pub fn blocks(&self) -> bool {
        !self.passed && !self.optional
    }
}

/// The part of a session the validator reads.
#[derive(Debug, Clone, Copy)]
pub struct ListingView<'a> {
    pub field_groups: &'a [FieldGroup],
    pub skus: &'a [Sku],
}

pub fn validate(view: ListingView<'_>) -> Vec<CheckResult> {
    vec![
        required_fields_completed(view.field_groups),
        assets_uploaded(view.field_groups),
        sku_info_complete(view.skus),
        pricing_filled(view.skus),
        optional_fields_pending(view.field_groups),
    ]
}

pub fn can_submit(view: ListingView<'_>) -> bool {
    validate(view).iter().all(|check| !check.blocks())
}

pub fn required_fields_completed(groups: &[FieldGroup]) -> CheckResult {
    let required: Vec<_> = all_fields(groups).filter(|f| f.required).collect();
    let done = required.iter().filter(|f| f.is_completed()).count();
    CheckResult::new(
        CheckKind::RequiredFieldsCompleted,
        done == required.len(),
        false,
        format!("{done}/{}", required.len()),
    )
}

pub fn assets_uploaded(groups: &[FieldGroup]) -> CheckResult {
    let required: Vec<_> = all_fields(groups)
        .filter(|f| f.required && f.is_asset())
        .collect();
    let done = required.iter().filter(|f| f.assets_uploaded()).count();
    let images: u32 = required
        .iter()
        .filter_map(|f| f.uploaded_asset_count())
        .sum();
    CheckResult::new(
        CheckKind::AssetsUploaded,
        done == required.len(),
        false,
        format!("{done}/{} fields, {images} assets", required.len()),
    )
}

pub fn sku_info_complete(skus: &[Sku]) -> CheckResult {
    let done = skus.iter().filter(|sku| sku.info_complete()).count();
    CheckResult::new(
        CheckKind::SkuInfoComplete,
        done == skus.len(),
        false,
        format!("{done}/{}", skus.len()),
    )
}

pub fn pricing_filled(skus: &[Sku]) -> CheckResult {
    let enabled: Vec<_> = skus.iter().filter(|sku| sku.enabled).collect();
    let done = enabled.iter().filter(|sku| sku.price_filled()).count();
    CheckResult::new(
        CheckKind::PricingFilled,
        done == enabled.len(),
        false,
        format!("{done}/{}", enabled.len()),
    )
}

pub fn optional_fields_pending(groups: &[FieldGroup]) -> CheckResult {
    let outstanding: Vec<&str> = all_fields(groups)
        .filter(|f| !f.required && f.status != FieldStatus::Completed)
        .map(|f| f.name.as_str())
        .collect();
    CheckResult::new(
        CheckKind::OptionalFieldsPending,
        outstanding.is_empty(),
        true,
        outstanding.join(", "),
    )
}
