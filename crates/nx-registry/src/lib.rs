//! Connector Registry & Dependency Resolution
//!
//! Manifest index (id -> ordered version list), registry document
//! import/export, and the backtracking semver resolver with lockfile
//! support.

use thiserror::Error;

pub mod manifest;
pub mod registry;
pub mod resolver;

pub use manifest::{
    AuthSpec, Compatibility, ConflictRules, ConnectorDependencies, ConnectorManifest,
    ConnectorType, DependencySpec, InputSpec, OutputSpec, PortType,
};
pub use registry::{ConnectorRegistry, RegistryDocument};
pub use resolver::{ResolutionOutcome, ResolutionStrategy, Resolver};

/// A lockfile: connector id -> exact pinned version.
pub type Lockfile = std::collections::HashMap<String, semver::Version>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connector version already registered: {id}@{version}")]
    DuplicateVersion { id: String, version: String },

    #[error("Unknown connector: {0}")]
    UnknownConnector(String),

    #[error("Invalid version range: {0}")]
    InvalidRange(String),

    #[error("Resolution failed: {0}")]
    Resolution(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
