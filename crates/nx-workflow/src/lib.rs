//! Workflow Execution Core
//!
//! The directed workflow graph model, static validation, versioned
//! connector adapters, credential handling, the run event bus, and the
//! execution engine.

use thiserror::Error;

pub mod adapter;
pub mod adapters;
pub mod credential;
pub mod engine;
pub mod events;
pub mod model;
pub mod repository;
pub mod validator;

pub use adapter::{
    AdapterContext, AdapterRegistry, ConnectorAdapter, ExecutionResult, RunMetadata,
};
pub use credential::{Credential, CredentialStore};
pub use engine::WorkflowEngine;
pub use events::{EventScope, RunEvent, RunEventBus, RunEventKind};
pub use model::{
    BranchLabel, ConditionConfig, ErrorHandling, ErrorStrategy, ExecutionMode, LoopConfig,
    LoopType, NodeExecutionResult, NodeStatus, Position, RetryConfig, RunMode, RunStatus,
    SubWorkflowConfig, Workflow, WorkflowEdge, WorkflowNode, WorkflowRun,
};
pub use repository::{
    InMemoryRunRepository, InMemoryWorkflowRepository, RunFilter, RunRepository,
    WorkflowRepository,
};
pub use validator::{CheckCode, Diagnostic, WorkflowValidator};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
