use crate::catalog::FolderSpec;
use serde::Serialize;
use std::collections::HashMap;

/// Read-only folder tree of the asset library, stored as an arena.
#[derive(Debug, Clone, Default)]
pub struct FolderTree {
    nodes: Vec<FolderNode>,
    roots: Vec<usize>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct FolderNode {
    pub id: String,
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl FolderNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FolderSelection {
    pub id: String,
    pub path: Vec<String>,
}

impl FolderTree {
    /// Later duplicates of an id are ignored so lookups stay unambiguous.
    pub fn from_specs(specs: &[FolderSpec]) -> Self {
        let mut tree = Self::default();
        for spec in specs {
            if let Some(idx) = tree.insert(spec, None) {
                tree.roots.push(idx);
            }
        }
        tree
    }

    fn insert(&mut self, spec: &FolderSpec, parent: Option<usize>) -> Option<usize> {
        if self.index.contains_key(&spec.id) {
            return None;
        }
        let idx = self.nodes.len();
        self.nodes.push(FolderNode {
            id: spec.id.clone(),
            name: spec.name.clone(),
            parent,
            children: Vec::new(),
        });
        self.index.insert(spec.id.clone(), idx);
        for child in &spec.children {
            if let Some(child_idx) = self.insert(child, Some(idx)) {
                self.nodes[idx].children.push(child_idx);
            }
        }
        Some(idx)
    }

    pub fn get(&self, id: &str) -> Option<&FolderNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestor names from the root down to and including the node itself.
    pub fn path(&self, id: &str) -> Option<Vec<String>> {
        let mut cursor = self.index.get(id).copied();
        let mut path = Vec::new();
        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            path.push(node.name.clone());
            cursor = node.parent;
        }
        if path.is_empty() {
            return None;
        }
        path.reverse();
        Some(path)
    }

    pub fn selection(&self, id: &str) -> Option<FolderSelection> {
        Some(FolderSelection {
            id: id.to_string(),
            path: self.path(id)?,
        })
    }

    pub fn to_specs(&self) -> Vec<FolderSpec> {
        self.roots.iter().map(|&idx| self.spec_at(idx)).collect()
    }

    fn spec_at(&self, idx: usize) -> FolderSpec {
        let node = &self.nodes[idx];
        FolderSpec {
            id: node.id.clone(),
            name: node.name.clone(),
            children: node.children.iter().map(|&c| self.spec_at(c)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn tree() -> FolderTree {
        FolderTree::from_specs(&Catalog::builtin().unwrap().folders)
    }

    #[test]
    fn path_lists_ancestors_then_self() {
        let tree = tree();
        assert_eq!(
            tree.path("grain-4").unwrap(),
            vec!["Products", "Organic grains", "Black sesame (roasted) 600g"]
        );
        assert_eq!(tree.path("all").unwrap(), vec!["All assets"]);
        assert!(tree.path("missing").is_none());
    }

    #[test]
    fn leaves_are_childless_nodes() {
        let tree = tree();
        assert!(tree.get("grain-4").unwrap().is_leaf());
        assert!(!tree.get("product").unwrap().is_leaf());
    }

    #[test]
    fn empty_listing_builds_an_empty_tree() {
        assert!(FolderTree::from_specs(&[]).is_empty());
        assert!(!tree().is_empty());
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let specs = vec![
            FolderSpec {
                id: "a".into(),
                name: "First".into(),
                children: vec![],
            },
            FolderSpec {
                id: "a".into(),
                name: "Second".into(),
                children: vec![],
            },
        ];
        let tree = FolderTree::from_specs(&specs);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get("a").unwrap().name, "First");
    }

    #[test]
    fn specs_round_trip_through_the_arena() {
        let catalog = Catalog::builtin().unwrap();
        let tree = FolderTree::from_specs(&catalog.folders);
        let specs = tree.to_specs();
        assert_eq!(specs.len(), catalog.folders.len());
        assert_eq!(FolderTree::from_specs(&specs).len(), tree.len());
    }
}
