//! Dependency Resolver
//!
//! Backtracking solver over registry entries and an optional lockfile.
//! Peer dependencies and direct connector dependencies are both hard
//! constraints. Candidate choice is deterministic: the unresolved id with
//! the fewest surviving candidates goes first (ties by id), candidates are
//! tried in strategy order.

use semver::{Version, VersionReq};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::manifest::{parse_conflict_pattern, ConnectorManifest};
use crate::registry::ConnectorRegistry;
use crate::RegistryError;

/// Candidate ordering strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Descending semver
    HighestCompatible,
    /// Non-prerelease versions first, then descending
    PreferStable,
    /// Like HighestCompatible, but the first constraint violation aborts
    /// instead of backtracking
    FailFast,
}

/// Serializable outcome for API surfaces.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub resolved_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl From<Result<BTreeMap<String, Version>, RegistryError>> for ResolutionOutcome {
    fn from(result: Result<BTreeMap<String, Version>, RegistryError>) -> Self {
        match result {
            Ok(resolved) => ResolutionOutcome {
                success: true,
                resolved_versions: resolved
                    .into_iter()
                    .map(|(id, v)| (id, v.to_string()))
                    .collect(),
                error_message: None,
            },
            Err(e) => ResolutionOutcome {
                success: false,
                resolved_versions: BTreeMap::new(),
                error_message: Some(e.to_string()),
            },
        }
    }
}

pub struct Resolver<'a> {
    registry: &'a ConnectorRegistry,
    strategy: ResolutionStrategy,
    lockfile: HashMap<String, Version>,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a ConnectorRegistry, strategy: ResolutionStrategy) -> Self {
        Self {
            registry,
            strategy,
            lockfile: HashMap::new(),
        }
    }

    pub fn with_lockfile(mut self, lockfile: HashMap<String, Version>) -> Self {
        self.lockfile = lockfile;
        self
    }

    /// Solve the requirement set. On success every requirement and every
    /// transitively merged dependency has a selected version satisfying all
    /// of its ranges (and its lockfile pin, when referenced).
    pub fn resolve(
        &self,
        requirements: &[(String, VersionReq)],
    ) -> Result<BTreeMap<String, Version>, RegistryError> {
        let mut constraints: HashMap<String, Vec<VersionReq>> = HashMap::new();
        for (id, range) in requirements {
            constraints.entry(id.clone()).or_default().push(range.clone());
        }

        let selection = BTreeMap::new();
        self.solve(constraints, selection)
    }

    fn solve(
        &self,
        constraints: HashMap<String, Vec<VersionReq>>,
        selection: BTreeMap<String, Version>,
    ) -> Result<BTreeMap<String, Version>, RegistryError> {
        // fewest-options-first over unresolved ids, tie-break by id
        let mut unresolved: Vec<(usize, String)> = constraints
            .keys()
            .filter(|id| !selection.contains_key(*id))
            .map(|id| (self.candidates(id, &constraints).len(), id.clone()))
            .collect();
        unresolved.sort();

        let Some((candidate_count, id)) = unresolved.into_iter().next() else {
            return Ok(selection);
        };

        if candidate_count == 0 {
            return Err(self.unsatisfiable(&id, &constraints));
        }

        let mut last_error = None;
        for candidate in self.candidates(&id, &constraints) {
            match self.try_candidate(&candidate, &constraints, &selection) {
                Ok((next_constraints, next_selection)) => {
                    match self.solve(next_constraints, next_selection) {
                        Ok(done) => return Ok(done),
                        Err(e) if self.strategy == ResolutionStrategy::FailFast => return Err(e),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(e) if self.strategy == ResolutionStrategy::FailFast => return Err(e),
                Err(e) => {
                    debug!(
                        connector_id = %id,
                        version = %candidate.version,
                        error = %e,
                        "Candidate rejected, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| self.unsatisfiable(&id, &constraints)))
    }

    /// Tentatively select one candidate: conflict checks, then merge its
    /// declared dependencies into the constraint set and prune.
    fn try_candidate(
        &self,
        candidate: &Arc<ConnectorManifest>,
        constraints: &HashMap<String, Vec<VersionReq>>,
        selection: &BTreeMap<String, Version>,
    ) -> Result<(HashMap<String, Vec<VersionReq>>, BTreeMap<String, Version>), RegistryError> {
        // candidate's conflict rules against already selected ids
        for pattern in &candidate.conflict_rules.incompatible_with {
            if let Some((other_id, range)) = parse_conflict_pattern(pattern) {
                if let Some(selected) = selection.get(other_id) {
                    if range.matches(selected) {
                        return Err(RegistryError::Resolution(format!(
                            "{}@{} is incompatible with selected {}@{}",
                            candidate.id, candidate.version, other_id, selected
                        )));
                    }
                }
            }
        }
        // and the reverse: existing selections declaring conflicts with us
        for (selected_id, selected_version) in selection {
            if let Some(manifest) = self.registry.find(selected_id, selected_version) {
                for pattern in &manifest.conflict_rules.incompatible_with {
                    if let Some((other_id, range)) = parse_conflict_pattern(pattern) {
                        if other_id == candidate.id && range.matches(&candidate.version) {
                            return Err(RegistryError::Resolution(format!(
                                "selected {}@{} is incompatible with {}@{}",
                                selected_id, selected_version, candidate.id, candidate.version
                            )));
                        }
                    }
                }
            }
        }

        let mut next_constraints = constraints.clone();
        let dependencies = candidate
            .dependencies
            .peers
            .iter()
            .chain(candidate.dependencies.connectors.iter());
        for dependency in dependencies {
            let range = VersionReq::parse(&dependency.range).map_err(|e| {
                RegistryError::InvalidRange(format!(
                    "{} depends on {} with bad range '{}': {}",
                    candidate.id, dependency.id, dependency.range, e
                ))
            })?;
            // an already-selected version must satisfy the new range too
            if let Some(selected) = selection.get(&dependency.id) {
                if !range.matches(selected) {
                    return Err(RegistryError::Resolution(format!(
                        "{}@{} requires {} {}, but {} is already selected",
                        candidate.id, candidate.version, dependency.id, dependency.range, selected
                    )));
                }
            }
            next_constraints
                .entry(dependency.id.clone())
                .or_default()
                .push(range);
        }

        let mut next_selection = selection.clone();
        next_selection.insert(candidate.id.clone(), candidate.version.clone());

        // prune: every unresolved constrained id must keep at least one
        // satisfying candidate
        for id in next_constraints.keys() {
            if next_selection.contains_key(id) {
                continue;
            }
            if self.candidates(id, &next_constraints).is_empty() {
                return Err(self.unsatisfiable(id, &next_constraints));
            }
        }

        Ok((next_constraints, next_selection))
    }

    /// Registry versions of `id` surviving all constraints and the lockfile
    /// pin, in strategy order.
    fn candidates(
        &self,
        id: &str,
        constraints: &HashMap<String, Vec<VersionReq>>,
    ) -> Vec<Arc<ConnectorManifest>> {
        let ranges = constraints.get(id);
        let pin = self.lockfile.get(id);

        let mut survivors: Vec<Arc<ConnectorManifest>> = self
            .registry
            .versions(id)
            .into_iter()
            .filter(|m| pin.map(|v| &m.version == v).unwrap_or(true))
            .filter(|m| {
                ranges
                    .map(|rs| rs.iter().all(|r| r.matches(&m.version)))
                    .unwrap_or(true)
            })
            .collect();

        if self.strategy == ResolutionStrategy::PreferStable {
            // registry order is already descending; stable partition keeps it
            survivors.sort_by_key(|m| !m.version.pre.is_empty());
        }
        survivors
    }

    fn unsatisfiable(
        &self,
        id: &str,
        constraints: &HashMap<String, Vec<VersionReq>>,
    ) -> RegistryError {
        let ranges: Vec<String> = constraints
            .get(id)
            .map(|rs| rs.iter().map(|r| r.to_string()).collect())
            .unwrap_or_default();
        let pin = self
            .lockfile
            .get(id)
            .map(|v| format!(" (lockfile pins {})", v))
            .unwrap_or_default();
        if !self.registry.contains(id) {
            RegistryError::UnknownConnector(id.to_string())
        } else {
            RegistryError::Resolution(format!(
                "no version of '{}' satisfies {:?}{}",
                id, ranges, pin
            ))
        }
    }
}
