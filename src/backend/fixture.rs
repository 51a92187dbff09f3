//! Offline inventory backend loaded from a JSON document.
//!
//! Every backend trait is answered from canned data: project and resource
//! listings, raw size-tool output per strategy, describe documents, injected
//! failures and artificial latency. Used for dry runs and end-to-end tests.
//!
//! ```json
//! {
//!   "projects": [{
//!     "id": "proj-a",
//!     "disabled": ["file_share"],
//!     "buckets": [{"name": "logs", "primary": "0  gs://logs", "secondary": "1500000000"}],
//!     "disks": [{"name": "boot", "scope": "us-east1-b", "metadata": {"sizeGb": "100"}}]
//!   }]
//! }
//! ```

#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{
    BackendError, BackendResult, BackendSet, MetadataBackend, ProjectEnumerator,
    ResourceEnumerator, SizeBackend,
};
use crate::core::errors::{AuditError, Result};
use crate::inventory::record::{ResourceRef, ResourceType};

/// Whole fixture document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureInventory {
    pub projects: Vec<FixtureProject>,
    /// Simulate an unreachable backend: the pre-scan check fails.
    pub unreachable: bool,
    /// Simulate a failing project listing.
    pub project_listing_error: Option<String>,
    /// Simulate a missing secondary size tool: its availability check fails.
    pub secondary_unreachable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureProject {
    pub id: String,
    /// Resource types whose API is disabled in this project.
    pub disabled: Vec<ResourceType>,
    /// Resource types the credentials may not list in this project.
    pub denied: Vec<ResourceType>,
    pub buckets: Vec<FixtureResource>,
    pub disks: Vec<FixtureResource>,
    pub file_shares: Vec<FixtureResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureResource {
    pub name: String,
    pub scope: Option<String>,
    /// Raw output of the primary size tool.
    pub primary: Option<String>,
    pub primary_error: Option<String>,
    /// Raw output of the secondary size tool.
    pub secondary: Option<String>,
    pub secondary_error: Option<String>,
    pub metadata: Option<Value>,
    pub metadata_error: Option<String>,
    /// Latency added to every call touching this resource. A call whose
    /// deadline falls inside the latency sleeps until the deadline and times out.
    pub delay_ms: u64,
}

impl FixtureProject {
    fn resources(&self, resource_type: ResourceType) -> &[FixtureResource] {
        match resource_type {
            ResourceType::Bucket => &self.buckets,
            ResourceType::Disk => &self.disks,
            ResourceType::FileShare => &self.file_shares,
        }
    }
}

impl FixtureInventory {
    /// Read a fixture document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| AuditError::io(path, source))?;
        serde_json::from_str(&raw).map_err(|e| AuditError::ConfigParse {
            context: "fixture",
            details: format!("{}: {e}", path.display()),
        })
    }

    /// Wire every backend trait to this inventory.
    #[must_use]
    pub fn backend_set(self) -> BackendSet {
        let inventory = Arc::new(self);
        BackendSet {
            projects: Arc::new(FixtureProjects(Arc::clone(&inventory))),
            enumerators: ResourceType::ALL
                .iter()
                .map(|&resource_type| {
                    Arc::new(FixtureEnumerator {
                        inventory: Arc::clone(&inventory),
                        resource_type,
                    }) as Arc<dyn ResourceEnumerator>
                })
                .collect(),
            primary_size: Arc::new(FixtureSize {
                inventory: Arc::clone(&inventory),
                strategy: Strategy::Primary,
            }),
            secondary_size: Some(Arc::new(FixtureSize {
                inventory: Arc::clone(&inventory),
                strategy: Strategy::Secondary,
            })),
            metadata: Arc::new(FixtureMetadata(inventory)),
        }
    }

    fn project(&self, project_id: &str) -> BackendResult<&FixtureProject> {
        self.projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or_else(|| BackendError::AccessDenied(format!("unknown project {project_id}")))
    }

    fn resource(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        name: &str,
        deadline: Instant,
    ) -> BackendResult<&FixtureResource> {
        let resource = self
            .project(project_id)?
            .resources(resource_type)
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| {
                BackendError::Transport(format!("{resource_type} {name} not found in {project_id}"))
            })?;
        if resource.delay_ms > 0 {
            let delay = Duration::from_millis(resource.delay_ms);
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(delay.min(remaining));
            if delay > remaining {
                return Err(BackendError::Timeout(format!(
                    "{resource_type} {name} answered after its deadline"
                )));
            }
        }
        Ok(resource)
    }
}

fn canned(output: Option<&String>, error: Option<&String>) -> BackendResult<String> {
    match (output, error) {
        (_, Some(error)) => Err(BackendError::Transport(error.clone())),
        (Some(output), None) => Ok(output.clone()),
        (None, None) => Ok(String::new()),
    }
}

struct FixtureProjects(Arc<FixtureInventory>);

impl ProjectEnumerator for FixtureProjects {
    fn list_projects(&self) -> BackendResult<Vec<String>> {
        if let Some(error) = &self.0.project_listing_error {
            return Err(BackendError::Transport(error.clone()));
        }
        Ok(self.0.projects.iter().map(|p| p.id.clone()).collect())
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.0.unreachable {
            Err(BackendError::Transport(
                "fixture marked unreachable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

struct FixtureEnumerator {
    inventory: Arc<FixtureInventory>,
    resource_type: ResourceType,
}

impl ResourceEnumerator for FixtureEnumerator {
    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    fn list_resources(&self, project_id: &str) -> BackendResult<Vec<ResourceRef>> {
        let project = self.inventory.project(project_id)?;
        if project.disabled.contains(&self.resource_type) {
            return Err(BackendError::ApiDisabled(format!(
                "{} API disabled in {project_id}",
                self.resource_type
            )));
        }
        if project.denied.contains(&self.resource_type) {
            return Err(BackendError::AccessDenied(format!(
                "listing {} denied in {project_id}",
                self.resource_type
            )));
        }
        Ok(project
            .resources(self.resource_type)
            .iter()
            .map(|r| ResourceRef {
                name: r.name.clone(),
                scope: r.scope.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    Primary,
    Secondary,
}

struct FixtureSize {
    inventory: Arc<FixtureInventory>,
    strategy: Strategy,
}

impl SizeBackend for FixtureSize {
    fn name(&self) -> &'static str {
        match self.strategy {
            Strategy::Primary => "fixture-primary",
            Strategy::Secondary => "fixture-secondary",
        }
    }

    fn measure(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> BackendResult<String> {
        let r = self
            .inventory
            .resource(project_id, resource_type, &resource.name, deadline)?;
        match self.strategy {
            Strategy::Primary => canned(r.primary.as_ref(), r.primary_error.as_ref()),
            Strategy::Secondary => canned(r.secondary.as_ref(), r.secondary_error.as_ref()),
        }
    }

    fn check_available(&self) -> BackendResult<()> {
        match self.strategy {
            Strategy::Secondary if self.inventory.secondary_unreachable => Err(
                BackendError::Transport("fixture secondary tool unreachable".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

struct FixtureMetadata(Arc<FixtureInventory>);

impl MetadataBackend for FixtureMetadata {
    fn describe(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> BackendResult<Value> {
        let r = self
            .0
            .resource(project_id, resource_type, &resource.name, deadline)?;
        if let Some(error) = &r.metadata_error {
            return Err(BackendError::Transport(error.clone()));
        }
        Ok(r.metadata.clone().unwrap_or_else(|| Value::Object(Default::default())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inventory() -> FixtureInventory {
        serde_json::from_value(json!({
            "projects": [{
                "id": "proj-a",
                "disabled": ["file_share"],
                "denied": ["disk"],
                "buckets": [
                    {"name": "logs", "primary": "0  gs://logs", "secondary_error": "boom"}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn lists_projects_and_buckets() {
        let set = inventory().backend_set();
        assert_eq!(set.projects.list_projects().unwrap(), vec!["proj-a"]);
        let buckets = set.enumerators[0].list_resources("proj-a").unwrap();
        assert_eq!(buckets, vec![ResourceRef::named("logs")]);
    }

    #[test]
    fn disabled_and_denied_types_are_distinct_from_empty() {
        let set = inventory().backend_set();
        let by_type = |t: ResourceType| {
            set.enumerators
                .iter()
                .find(|e| e.resource_type() == t)
                .unwrap()
                .list_resources("proj-a")
        };
        assert!(matches!(
            by_type(ResourceType::FileShare),
            Err(BackendError::ApiDisabled(_))
        ));
        assert!(matches!(
            by_type(ResourceType::Disk),
            Err(BackendError::AccessDenied(_))
        ));
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn canned_outputs_and_errors() {
        let set = inventory().backend_set();
        let logs = ResourceRef::named("logs");
        assert_eq!(
            set.primary_size
                .measure("proj-a", ResourceType::Bucket, &logs, soon())
                .unwrap(),
            "0  gs://logs"
        );
        let secondary = set.secondary_size.unwrap();
        assert!(
            secondary
                .measure("proj-a", ResourceType::Bucket, &logs, soon())
                .is_err()
        );
        assert_eq!(
            set.metadata
                .describe("proj-a", ResourceType::Bucket, &logs, soon())
                .unwrap(),
            json!({})
        );
    }

    #[test]
    fn latency_past_the_deadline_times_out_at_the_deadline() {
        let mut inventory = inventory();
        inventory.projects[0].buckets[0].delay_ms = 10_000;
        let set = inventory.backend_set();
        let start = Instant::now();
        let err = set
            .primary_size
            .measure(
                "proj-a",
                ResourceType::Bucket,
                &ResourceRef::named("logs"),
                start + Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn secondary_availability_follows_the_document() {
        let mut inventory = inventory();
        let set = inventory.clone().backend_set();
        assert!(set.secondary_size.unwrap().check_available().is_ok());

        inventory.secondary_unreachable = true;
        let set = inventory.backend_set();
        assert!(set.primary_size.check_available().is_ok());
        assert!(set.secondary_size.unwrap().check_available().is_err());
    }

    #[test]
    fn load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FixtureInventory::load(&path).unwrap_err();
        assert_eq!(err.code(), "CSA-1003");
        assert!(err.to_string().contains("inventory.json"));
    }
}
