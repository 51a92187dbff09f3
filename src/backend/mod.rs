//! External collaborators behind narrow traits: project listing, resource
//! enumeration, raw size measurement and describe documents.
//!
//! The engine never knows which vendor tool answers; it only distinguishes the
//! failure classes in [`BackendError`].

#![allow(missing_docs)]

pub mod command;
pub mod fixture;
pub mod gcloud;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use crate::core::config::{BackendKind, Config};
use crate::core::errors::{AuditError, Result};
use crate::inventory::record::{ResourceRef, ResourceType};

/// Failure of one backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The service API is not enabled for the project.
    #[error("api_disabled: {0}")]
    ApiDisabled(String),
    /// Credentials lack permission.
    #[error("access_denied: {0}")]
    AccessDenied(String),
    /// Any other outright failure: network, non-zero exit, missing binary.
    #[error("transport: {0}")]
    Transport(String),
    /// The call did not finish before its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl BackendError {
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::ApiDisabled(m) | Self::AccessDenied(m) | Self::Transport(m) | Self::Timeout(m) => {
                m
            }
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ApiDisabled(_) => "api_disabled",
            Self::AccessDenied(_) => "access_denied",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Result alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Lists the projects visible to the current credentials.
pub trait ProjectEnumerator: Send + Sync {
    fn list_projects(&self) -> BackendResult<Vec<String>>;

    /// Cheap reachability check run before any scanning starts.
    fn check_available(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Lists the resources of one type inside a project.
///
/// Must return `ApiDisabled` / `AccessDenied` rather than an empty list when the
/// project cannot be inspected.
pub trait ResourceEnumerator: Send + Sync {
    fn resource_type(&self) -> ResourceType;
    fn list_resources(&self, project_id: &str) -> BackendResult<Vec<ResourceRef>>;
}

/// One measurement strategy: returns the raw text a size tool printed.
///
/// Implementations must give up with [`BackendError::Timeout`] once `deadline`
/// passes; the caller's concurrency slot stays held until they return.
pub trait SizeBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn measure(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> BackendResult<String>;

    /// Reachability check for the tool behind this strategy.
    fn check_available(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Fetches the describe document of one resource, giving up at `deadline`.
pub trait MetadataBackend: Send + Sync {
    fn describe(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> BackendResult<Value>;
}

/// The concrete backends one audit runs against.
#[derive(Clone)]
pub struct BackendSet {
    pub projects: Arc<dyn ProjectEnumerator>,
    pub enumerators: Vec<Arc<dyn ResourceEnumerator>>,
    pub primary_size: Arc<dyn SizeBackend>,
    pub secondary_size: Option<Arc<dyn SizeBackend>>,
    pub metadata: Arc<dyn MetadataBackend>,
}

impl BackendSet {
    /// Keep only the enumerators for enabled resource types.
    #[must_use]
    pub fn restricted_to(mut self, enabled: &[ResourceType]) -> Self {
        self.enumerators
            .retain(|e| enabled.contains(&e.resource_type()));
        self
    }
}

/// Build the backend set selected by `[backend] kind`.
pub fn build(config: &Config) -> Result<BackendSet> {
    let set = match config.backend.kind {
        BackendKind::Gcloud => gcloud::backend_set(&config.backend),
        BackendKind::Fixture => {
            let path = config
                .backend
                .fixture_path
                .as_ref()
                .ok_or_else(|| AuditError::InvalidConfig {
                    details: "backend.fixture_path is required for the fixture backend"
                        .to_string(),
                })?;
            fixture::FixtureInventory::load(path)?.backend_set()
        }
    };
    Ok(set.restricted_to(&config.resources.enabled_types()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_display_carries_class() {
        let err = BackendError::ApiDisabled("storage api off".to_string());
        assert_eq!(err.to_string(), "api_disabled: storage api off");
        assert_eq!(err.message(), "storage api off");
    }

    #[test]
    fn backend_error_is_a_std_error_with_its_label_as_prefix() {
        let errors = [
            BackendError::ApiDisabled("a".to_string()),
            BackendError::AccessDenied("b".to_string()),
            BackendError::Transport("c".to_string()),
            BackendError::Timeout("d".to_string()),
        ];
        for err in errors {
            let label = err.label();
            let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
            assert!(boxed.to_string().starts_with(&format!("{label}: ")));
            assert!(boxed.source().is_none());
        }
    }

    #[test]
    fn restricted_set_drops_disabled_types() {
        let inventory = fixture::FixtureInventory::default();
        let set = inventory.backend_set().restricted_to(&[ResourceType::Disk]);
        let kinds: Vec<ResourceType> = set.enumerators.iter().map(|e| e.resource_type()).collect();
        assert_eq!(kinds, vec![ResourceType::Disk]);
    }
}
