use crate::config::CATALOG_PATH;
use crate::models::{AssetOrigin, FieldKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const DEFAULT_CATALOG: &str = include_str!("../config/catalog.yaml");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid catalog: {0}")]
    Parse(String),
    #[error("invalid field layout: {0}")]
    Layout(String),
}

/// Static reference data shared by every session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Catalog {
    pub layout: FieldLayout,
    #[serde(default)]
    pub categories: Vec<CategoryNode>,
    #[serde(default)]
    pub datasources: Vec<DatasourceSpec>,
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
    #[serde(default)]
    pub folders: Vec<FolderSpec>,
}

/// Field rules the marketplace expects, grouped the way listings are reviewed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldLayout {
    pub groups: Vec<GroupRule>,
    /// Group receiving collected params and overlay fields that no rule names.
    pub extra_group: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupRule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldRule {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub title: bool,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub origin: Option<AssetOrigin>,
    #[serde(default)]
    pub count: Option<u32>,
}

impl FieldRule {
    pub fn param_name(&self) -> &str {
        self.param.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryNode {
    pub name: String,
    #[serde(default)]
    pub children: Vec<CategoryNode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamedValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasourceSpec {
    pub id: String,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Vec<NamedValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub fields: Vec<NamedValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<FolderSpec>,
}

impl Catalog {
    pub fn load() -> Result<Self, CatalogError> {
        match CATALOG_PATH.as_deref() {
            Some(path) => Self::from_path(Path::new(path)),
            None => Self::from_yaml(DEFAULT_CATALOG),
        }
    }

    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_yaml(DEFAULT_CATALOG)
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|err| CatalogError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog =
            serde_yaml::from_str(raw).map_err(|err| CatalogError::Parse(err.to_string()))?;
        catalog.layout.validate()?;
        Ok(catalog)
    }

    /// True when `path` walks the category tree from a root down to a leaf.
    pub fn category_exists(&self, path: &[String]) -> bool {
        let mut level = &self.categories;
        for (depth, segment) in path.iter().enumerate() {
            let Some(node) = level.iter().find(|node| &node.name == segment) else {
                return false;
            };
            if depth + 1 == path.len() {
                return node.children.is_empty();
            }
            level = &node.children;
        }
        false
    }

    pub fn datasource(&self, id: &str) -> Option<&DatasourceSpec> {
        self.datasources.iter().find(|ds| ds.id == id)
    }

    pub fn template(&self, id: &str) -> Option<&TemplateSpec> {
        self.templates.iter().find(|tpl| tpl.id == id)
    }
}

impl FieldLayout {
    fn validate(&self) -> Result<(), CatalogError> {
        if !self.groups.iter().any(|group| group.id == self.extra_group) {
            return Err(CatalogError::Layout(format!(
                "extra_group `{}` is not a declared group",
                self.extra_group
            )));
        }
        for group in &self.groups {
            let mut seen = std::collections::HashSet::new();
            for rule in &group.fields {
                if !seen.insert(rule.name.as_str()) {
                    return Err(CatalogError::Layout(format!(
                        "duplicate field `{}` in group `{}`",
                        rule.name, group.id
                    )));
                }
                if rule.kind.is_asset() && rule.origin.is_none() {
                    return Err(CatalogError::Layout(format!(
                        "asset field `{}` has no origin",
                        rule.name
                    )));
                }
            }
        }
        Ok(())
    }
}
