//! Package overlay: the merged node view of all active packages
//!
//! Every active package contributes a set of nodes (files, directories,
//! symlinks) at package-relative paths. The overlay resolves each path to one
//! contribution:
//! - Higher `priority` wins; on equal priority the later activation wins
//! - Directories of different packages merge; `list` shows every child
//! - A node is hidden when one of its ancestors resolves to a non-directory
//!
//! Each active package also gets one dependency link per required name,
//! pointing at the highest-priority other active package that provides it.
//! Links are recomputed on every activate/deactivate.

use crate::allocator::NodeKind;
use crate::error::{AllocError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// One node shipped by a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageNode {
    pub path: String,
    pub kind: NodeKind,
    /// Symlink target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub priority: i32,
    /// Names other packages may require; the package name is always provided
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<PackageNode>,
}

impl PackageManifest {
    pub fn new(name: &str, version: &str) -> Self {
        PackageManifest {
            name: name.to_string(),
            version: version.to_string(),
            priority: 0,
            provides: Vec::new(),
            requires: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_node(mut self, path: &str, kind: NodeKind) -> Self {
        self.nodes.push(PackageNode {
            path: path.to_string(),
            kind,
            target: None,
        });
        self
    }

    pub fn providing(mut self, name: &str) -> Self {
        self.provides.push(name.to_string());
        self
    }

    pub fn requiring(mut self, name: &str) -> Self {
        self.requires.push(name.to_string());
        self
    }

    fn provides_name(&self, name: &str) -> bool {
        self.name == name || self.provides.iter().any(|p| p == name)
    }
}

/// Where a dependency link points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTarget {
    Package(String),
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLink {
    pub requirement: String,
    pub target: LinkTarget,
}

/// Visible node at a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedNode {
    pub path: String,
    pub kind: NodeKind,
    /// Package whose contribution is visible
    pub package: String,
    pub target: Option<String>,
}

struct ActivePackage {
    manifest: PackageManifest,
    /// Normalized path -> node
    nodes: BTreeMap<String, PackageNode>,
    activation: u64,
}

impl ActivePackage {
    fn rank(&self) -> (i32, u64) {
        (self.manifest.priority, self.activation)
    }

    /// Whether the package has anything strictly below `dir`
    fn has_descendants(&self, dir: &str) -> bool {
        if dir.is_empty() {
            return !self.nodes.is_empty();
        }
        let prefix = format!("{}/", dir);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(path, _)| path.starts_with(&prefix))
    }
}

/// Priority-resolved view of the active packages
#[derive(Default)]
pub struct PackageOverlay {
    /// In activation order
    active: Vec<ActivePackage>,
    next_activation: u64,
    links: BTreeMap<String, Vec<DependencyLink>>,
}

impl PackageOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a package; fails if a package of that name is already active
    pub fn activate(&mut self, manifest: PackageManifest) -> Result<()> {
        if self.find(&manifest.name).is_some() {
            return Err(AllocError::PackageAlreadyActive(manifest.name));
        }

        let mut nodes = BTreeMap::new();
        for node in &manifest.nodes {
            let path = normalize_path(&node.path)?;
            if path.is_empty() {
                return Err(AllocError::InvalidPath(node.path.clone()));
            }
            nodes.insert(path, node.clone());
        }

        info!(
            "Activating package {} {} (priority {}, {} nodes)",
            manifest.name,
            manifest.version,
            manifest.priority,
            nodes.len()
        );

        self.active.push(ActivePackage {
            manifest,
            nodes,
            activation: self.next_activation,
        });
        self.next_activation += 1;
        self.relink();
        Ok(())
    }

    /// Deactivate a package and hand back its manifest
    pub fn deactivate(&mut self, name: &str) -> Result<PackageManifest> {
        let index = self
            .find(name)
            .ok_or_else(|| AllocError::UnknownPackage(name.to_string()))?;
        let package = self.active.remove(index);
        info!("Deactivated package {}", name);
        self.relink();
        Ok(package.manifest)
    }

    /// Names of the active packages, in activation order
    pub fn active_packages(&self) -> Vec<&str> {
        self.active
            .iter()
            .map(|p| p.manifest.name.as_str())
            .collect()
    }

    /// Visible node at `path`, if any
    ///
    /// The root always resolves to a directory. Paths that only exist as
    /// ancestors of package nodes resolve to directories too.
    pub fn resolve(&self, path: &str) -> Result<Option<ResolvedNode>> {
        let path = normalize_path(path)?;
        Ok(self.resolve_normalized(&path))
    }

    /// Visible child names of directory `dir`, sorted
    pub fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = normalize_path(dir)?;
        match self.resolve_normalized(&dir) {
            Some(node) if node.kind == NodeKind::Directory => {}
            Some(_) => return Err(AllocError::InvalidPath(format!("{} is not a directory", dir))),
            None => return Err(AllocError::InvalidPath(format!("{} does not exist", dir))),
        }

        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let mut children = BTreeSet::new();
        for package in &self.active {
            for path in package.nodes.keys() {
                if let Some(rest) = path.strip_prefix(&prefix) {
                    if let Some(child) = rest.split('/').next() {
                        children.insert(child.to_string());
                    }
                }
            }
        }
        Ok(children.into_iter().collect())
    }

    /// Dependency links of an active package
    pub fn dependency_links(&self, name: &str) -> Result<&[DependencyLink]> {
        self.links
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| AllocError::UnknownPackage(name.to_string()))
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.active.iter().position(|p| p.manifest.name == name)
    }

    fn resolve_normalized(&self, path: &str) -> Option<ResolvedNode> {
        if path.is_empty() {
            return Some(ResolvedNode {
                path: String::new(),
                kind: NodeKind::Directory,
                package: String::new(),
                target: None,
            });
        }

        if let Some((parent, _)) = path.rsplit_once('/') {
            match self.resolve_normalized(parent) {
                Some(node) if node.kind == NodeKind::Directory => {}
                _ => return None,
            }
        }

        let explicit = self
            .active
            .iter()
            .filter_map(|p| p.nodes.get(path).map(|node| (p, node)))
            .max_by_key(|(p, _)| p.rank());
        if let Some((package, node)) = explicit {
            return Some(ResolvedNode {
                path: path.to_string(),
                kind: node.kind,
                package: package.manifest.name.clone(),
                target: node.target.clone(),
            });
        }

        self.active
            .iter()
            .filter(|p| p.has_descendants(path))
            .max_by_key(|p| p.rank())
            .map(|package| ResolvedNode {
                path: path.to_string(),
                kind: NodeKind::Directory,
                package: package.manifest.name.clone(),
                target: None,
            })
    }

    fn relink(&mut self) {
        let mut links = BTreeMap::new();
        for package in &self.active {
            let resolved = package
                .manifest
                .requires
                .iter()
                .map(|requirement| {
                    let provider = self
                        .active
                        .iter()
                        .filter(|p| p.manifest.name != package.manifest.name)
                        .filter(|p| p.manifest.provides_name(requirement))
                        .max_by_key(|p| p.rank());
                    let target = match provider {
                        Some(p) => LinkTarget::Package(p.manifest.name.clone()),
                        None => {
                            warn!(
                                "Package {} requires {} which no active package provides",
                                package.manifest.name, requirement
                            );
                            LinkTarget::Unresolved
                        }
                    };
                    DependencyLink {
                        requirement: requirement.clone(),
                        target,
                    }
                })
                .collect();
            links.insert(package.manifest.name.clone(), resolved);
        }
        debug!("Recomputed dependency links for {} package(s)", links.len());
        self.links = links;
    }
}

/// Strip leading/trailing slashes and reject empty, `.` and `..` components
fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed
        .split('/')
        .any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(AllocError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}
