//! Connector Registry
//!
//! Copy-on-write index from connector id to its ordered version list.
//! Readers take an `Arc` snapshot and never block writers; writers rebuild
//! the index and swap it in. Versions are held newest-first.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::manifest::ConnectorManifest;
use crate::RegistryError;

type Index = HashMap<String, Vec<Arc<ConnectorManifest>>>;

/// Wire format of a registry document (import/export).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    pub schema: String,
    pub registry_version: String,
    pub last_updated: DateTime<Utc>,
    pub connectors: Vec<ConnectorManifest>,
}

pub struct ConnectorRegistry {
    index: RwLock<Arc<Index>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// A consistent point-in-time snapshot of the whole index.
    pub fn snapshot(&self) -> Arc<Index> {
        self.index.read().clone()
    }

    /// Register one manifest. Re-registering an existing `id@version` is an
    /// error: published versions are immutable.
    pub fn insert(&self, manifest: ConnectorManifest) -> Result<(), RegistryError> {
        let mut guard = self.index.write();
        let mut next: Index = (**guard).clone();
        let versions = next.entry(manifest.id.clone()).or_default();

        if versions.iter().any(|m| m.version == manifest.version) {
            return Err(RegistryError::DuplicateVersion {
                id: manifest.id.clone(),
                version: manifest.version.to_string(),
            });
        }

        info!(
            connector_id = %manifest.id,
            version = %manifest.version,
            "Connector version registered"
        );
        versions.push(Arc::new(manifest));
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        *guard = Arc::new(next);
        Ok(())
    }

    /// All versions of a connector, newest first.
    pub fn versions(&self, id: &str) -> Vec<Arc<ConnectorManifest>> {
        self.snapshot().get(id).cloned().unwrap_or_default()
    }

    pub fn find(&self, id: &str, version: &Version) -> Option<Arc<ConnectorManifest>> {
        self.snapshot()
            .get(id)?
            .iter()
            .find(|m| &m.version == version)
            .cloned()
    }

    /// Newest version satisfying an optional range.
    pub fn latest_matching(&self, id: &str, range: Option<&VersionReq>) -> Option<Arc<ConnectorManifest>> {
        self.snapshot()
            .get(id)?
            .iter()
            .find(|m| range.map(|r| r.matches(&m.version)).unwrap_or(true))
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().contains_key(id)
    }

    pub fn connector_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Import every connector of a registry document. Already-present
    /// versions are skipped rather than rejected, so re-imports are
    /// idempotent.
    pub fn import_document(&self, document: RegistryDocument) -> usize {
        let mut imported = 0;
        for manifest in document.connectors {
            let exists = self
                .find(&manifest.id, &manifest.version)
                .is_some();
            if !exists && self.insert(manifest).is_ok() {
                imported += 1;
            }
        }
        imported
    }

    /// Pure snapshot export.
    pub fn export_document(&self) -> RegistryDocument {
        let snapshot = self.snapshot();
        let mut connectors: Vec<ConnectorManifest> = snapshot
            .values()
            .flatten()
            .map(|m| (**m).clone())
            .collect();
        connectors.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| b.version.cmp(&a.version)));

        RegistryDocument {
            schema: "notifyx/connector-registry".to_string(),
            registry_version: "1".to_string(),
            last_updated: Utc::now(),
            connectors,
        }
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        AuthSpec, Compatibility, ConflictRules, ConnectorDependencies, ConnectorType,
    };

    fn manifest(id: &str, version: &str) -> ConnectorManifest {
        ConnectorManifest {
            id: id.into(),
            version: Version::parse(version).unwrap(),
            connector_type: ConnectorType::Action,
            category: "test".into(),
            inputs: vec![],
            outputs: vec![],
            auth: AuthSpec::default(),
            dependencies: ConnectorDependencies::default(),
            conflict_rules: ConflictRules::default(),
            compatibility: Compatibility::default(),
        }
    }

    #[test]
    fn versions_are_ordered_newest_first() {
        let registry = ConnectorRegistry::new();
        registry.insert(manifest("a", "1.0.0")).unwrap();
        registry.insert(manifest("a", "2.1.0")).unwrap();
        registry.insert(manifest("a", "1.5.0")).unwrap();

        let versions: Vec<String> = registry
            .versions("a")
            .iter()
            .map(|m| m.version.to_string())
            .collect();
        assert_eq!(versions, vec!["2.1.0", "1.5.0", "1.0.0"]);
    }

    #[test]
    fn published_versions_are_immutable() {
        let registry = ConnectorRegistry::new();
        registry.insert(manifest("a", "1.0.0")).unwrap();
        assert!(registry.insert(manifest("a", "1.0.0")).is_err());
    }

    #[test]
    fn latest_matching_respects_range() {
        let registry = ConnectorRegistry::new();
        registry.insert(manifest("a", "1.0.0")).unwrap();
        registry.insert(manifest("a", "2.0.0")).unwrap();

        let range = VersionReq::parse("<2.0.0").unwrap();
        let found = registry.latest_matching("a", Some(&range)).unwrap();
        assert_eq!(found.version, Version::new(1, 0, 0));

        let unconstrained = registry.latest_matching("a", None).unwrap();
        assert_eq!(unconstrained.version, Version::new(2, 0, 0));
    }

    #[test]
    fn snapshot_is_stable_across_writes() {
        let registry = ConnectorRegistry::new();
        registry.insert(manifest("a", "1.0.0")).unwrap();
        let snapshot = registry.snapshot();
        registry.insert(manifest("a", "2.0.0")).unwrap();
        // the old snapshot still sees one version
        assert_eq!(snapshot.get("a").unwrap().len(), 1);
        assert_eq!(registry.versions("a").len(), 2);
    }

    #[test]
    fn document_roundtrip_is_idempotent() {
        let registry = ConnectorRegistry::new();
        registry.insert(manifest("a", "1.0.0")).unwrap();
        registry.insert(manifest("b", "1.0.0")).unwrap();

        let document = registry.export_document();
        assert_eq!(document.connectors.len(), 2);

        let other = ConnectorRegistry::new();
        assert_eq!(other.import_document(document.clone()), 2);
        assert_eq!(other.import_document(document), 0);
    }
}
