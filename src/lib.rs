//! Secrets Deployer Library
//!
//! Core functionality for deploying secrets from a vault service to the
//! local filesystem and reconciling the systemd services that consume them.
//! Tests are included in the module files (e.g., reconciler.rs) plus the
//! integration suite under tests/.

pub mod error;
pub mod hashstore;
pub mod manifest;
pub mod materializer;
pub mod paths;
pub mod pipeline;
pub mod reconciler;
pub mod validation;
pub mod vault;

pub use error::{DeployError, VaultErrorKind};
pub use manifest::Manifest;
pub use pipeline::{Pipeline, PipelineConfig, RunReport};
