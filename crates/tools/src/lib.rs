//! Tooling for the voice broker.
//!
//! A static registry maps tool slugs to code-defined descriptors and the
//! integration classes that can back them. The session executor resolves an
//! agent's bindings, caches one integration instance per tool, and runs
//! tool rounds with the ordering and error-as-data semantics the
//! orchestrator relies on.

pub mod executor;
pub mod integrations;
pub mod registry;

use std::time::Duration;

use thiserror::Error;

/// Tool errors. These almost never escape the executor: at the boundary
/// they are converted into `{success:false, error}` tool results so the
/// model can recover.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool not available")]
    NotAvailable,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("integration error: {0}")]
    Integration(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub use executor::{ExecutorConfig, IntegrationResolver, SessionToolExecutor};
pub use integrations::{
    CatalogSource, OrderBackend, OrderItem, OrderLookupTool, OrderRecord, ProductAttribute,
    SourceProduct, ToolIntegration,
};
pub use registry::{registry_resolver, ToolDescriptor, ToolRegistry};
