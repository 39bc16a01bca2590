use crate::catalog::{FieldLayout, FieldRule};
use crate::models::{
    AssetOrigin, CollectedProduct, Field, FieldGroup, FieldSource, FieldStatus, find_field,
};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("collected listing is incomplete: missing {missing}")]
    CollectionIncomplete { missing: &'static str },
}

/// Builds the field groups of a listing: collected data seeds every group,
/// then the matched and template overlays are laid on top, in that order.
pub fn merge(
    layout: &FieldLayout,
    collected: &CollectedProduct,
    matched: Option<&[Field]>,
    template: Option<&[Field]>,
) -> Result<Vec<FieldGroup>, MergeError> {
    if collected.title.trim().is_empty() {
        return Err(MergeError::CollectionIncomplete { missing: "title" });
    }
    if collected.price.is_none() {
        return Err(MergeError::CollectionIncomplete { missing: "price" });
    }

    let mut groups = seed(layout, collected);
    if let Some(fields) = matched {
        apply_overlay(&mut groups, &layout.extra_group, fields, FieldSource::Matched);
    }
    if let Some(fields) = template {
        apply_overlay(&mut groups, &layout.extra_group, fields, FieldSource::Template);
    }
    Ok(groups)
}

/// Copies state that outlives a re-merge from `previous` into `next`: upload
/// progress of asset fields and operator edits no overlay supersedes.
pub fn carry_forward(previous: &[FieldGroup], next: &mut [FieldGroup]) {
    for group in next.iter_mut() {
        for field in group.fields.iter_mut() {
            let Some(prev) = find_field(previous, &group.id, &field.name) else {
                continue;
            };
            if field.is_asset() && prev.kind == field.kind {
                field.status = prev.status;
                field.value = prev.value.clone();
                field.assets = prev.assets.clone();
                field.last_error = prev.last_error.clone();
            } else if prev.source == FieldSource::Manual && field.source == FieldSource::Collected {
                *field = prev.clone();
            }
        }
    }
}

fn seed(layout: &FieldLayout, collected: &CollectedProduct) -> Vec<FieldGroup> {
    let mut consumed: HashSet<&str> = HashSet::new();
    let mut groups = Vec::with_capacity(layout.groups.len());

    for rule_group in &layout.groups {
        let mut group = FieldGroup::new(rule_group.id.clone(), rule_group.title.clone());
        for rule in &rule_group.fields {
            let field = if rule.kind.is_asset() {
                seed_asset(rule, collected)
            } else if rule.title {
                seed_text(rule, &collected.title)
            } else {
                consumed.insert(rule.param_name());
                seed_text(rule, collected.param(rule.param_name()).unwrap_or_default())
            };
            group.upsert(field);
        }
        groups.push(group);
    }

    if let Some(extra) = groups.iter_mut().find(|g| g.id == layout.extra_group) {
        for param in &collected.params {
            if consumed.contains(param.name.as_str()) || extra.field(&param.name).is_some() {
                continue;
            }
            let status = if param.value.trim().is_empty() {
                FieldStatus::Optional
            } else {
                FieldStatus::Completed
            };
            extra.fields.push(Field::text(
                param.name.clone(),
                param.value.clone(),
                FieldSource::Collected,
                status,
                false,
            ));
        }
    }
    groups
}

fn seed_text(rule: &FieldRule, value: &str) -> Field {
    let value = value.trim();
    let status = match (value.is_empty(), rule.required, rule.confirm) {
        (true, true, _) => FieldStatus::Pending,
        (true, false, _) => FieldStatus::Optional,
        (false, _, true) => FieldStatus::Pending,
        (false, _, false) => FieldStatus::Completed,
    };
    Field::text(
        rule.name.clone(),
        value,
        FieldSource::Collected,
        status,
        rule.required,
    )
}

fn seed_asset(rule: &FieldRule, collected: &CollectedProduct) -> Field {
    let origin = rule.origin.unwrap_or(AssetOrigin::Generated);
    let target = match origin {
        AssetOrigin::MainImages => collected.main_images.len() as u32,
        AssetOrigin::DetailImages => collected.detail_images.len() as u32,
        AssetOrigin::Video => u32::from(collected.has_video),
        AssetOrigin::Generated => rule.count.unwrap_or(1),
    };
    let status = match (origin, rule.required) {
        (AssetOrigin::Generated, _) => FieldStatus::NeedsGeneration,
        (_, true) => FieldStatus::Pending,
        (_, false) => FieldStatus::Optional,
    };
    Field::asset(
        rule.name.clone(),
        rule.kind,
        origin,
        target,
        status,
        rule.required,
    )
}

fn apply_overlay(
    groups: &mut [FieldGroup],
    extra_group: &str,
    overlay: &[Field],
    source: FieldSource,
) {
    for incoming in overlay {
        if incoming.is_asset() {
            continue;
        }
        let existing = groups
            .iter_mut()
            .find_map(|group| group.field_mut(&incoming.name));
        match existing {
            Some(field) if field.is_asset() => {}
            Some(field) => {
                field.value = incoming.value.clone();
                field.source = source;
                field.status = FieldStatus::Completed;
                field.last_error = None;
            }
            None => {
                if let Some(group) = groups.iter_mut().find(|g| g.id == extra_group) {
                    group.fields.push(Field::text(
                        incoming.name.clone(),
                        incoming.value.clone(),
                        source,
                        FieldStatus::Completed,
                        incoming.required,
                    ));
                }
            }
        }
    }
}
