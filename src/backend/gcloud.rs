//! Google Cloud backends implemented over the `gcloud` and `gsutil` CLIs.
//!
//! Buckets are measured twice by differently-implemented tools:
//! `gcloud storage du --summarize` (primary) and `gsutil du -s` (secondary).
//! Disks and file shares carry their provisioned size in the describe document.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::backend::command::CommandRunner;
use crate::backend::{
    BackendError, BackendResult, BackendSet, MetadataBackend, ProjectEnumerator,
    ResourceEnumerator, SizeBackend,
};
use crate::core::config::BackendConfig;
use crate::inventory::record::{ResourceRef, ResourceType};

/// Assemble the gcloud-backed set from configuration.
#[must_use]
pub fn backend_set(config: &BackendConfig) -> BackendSet {
    let timeout = Duration::from_secs(config.command_timeout_secs);
    let gcloud = CommandRunner::new(&config.gcloud_bin, timeout);
    let gsutil = CommandRunner::new(&config.gsutil_bin, timeout);

    BackendSet {
        projects: Arc::new(GcloudProjects {
            gcloud: gcloud.clone(),
        }),
        enumerators: ResourceType::ALL
            .iter()
            .map(|&resource_type| {
                Arc::new(GcloudEnumerator {
                    gcloud: gcloud.clone(),
                    resource_type,
                }) as Arc<dyn ResourceEnumerator>
            })
            .collect(),
        primary_size: Arc::new(StorageDuSummarize {
            gcloud: gcloud.clone(),
        }),
        secondary_size: Some(Arc::new(GsutilDu { gsutil })),
        metadata: Arc::new(GcloudDescribe { gcloud }),
    }
}

struct GcloudProjects {
    gcloud: CommandRunner,
}

impl ProjectEnumerator for GcloudProjects {
    fn list_projects(&self) -> BackendResult<Vec<String>> {
        let out = self
            .gcloud
            .run_checked(&["projects", "list", "--format=value(projectId)"])?;
        Ok(non_empty_lines(&out).map(str::to_string).collect())
    }

    fn check_available(&self) -> BackendResult<()> {
        self.gcloud.run_checked(&["--version"]).map(|_| ())
    }
}

struct GcloudEnumerator {
    gcloud: CommandRunner,
    resource_type: ResourceType,
}

impl ResourceEnumerator for GcloudEnumerator {
    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    fn list_resources(&self, project_id: &str) -> BackendResult<Vec<ResourceRef>> {
        let project = format!("--project={project_id}");
        match self.resource_type {
            ResourceType::Bucket => {
                let out = self.gcloud.run_checked(&[
                    "storage",
                    "buckets",
                    "list",
                    project.as_str(),
                    "--format=value(name)",
                ])?;
                Ok(non_empty_lines(&out).map(ResourceRef::named).collect())
            }
            ResourceType::Disk => {
                let out = self.gcloud.run_checked(&[
                    "compute",
                    "disks",
                    "list",
                    project.as_str(),
                    "--format=value(name,zone.basename())",
                ])?;
                Ok(parse_scoped_listing(&out))
            }
            ResourceType::FileShare => {
                let out = self.gcloud.run_checked(&[
                    "filestore",
                    "instances",
                    "list",
                    project.as_str(),
                    "--format=value(name.basename(),name.segment(3))",
                ])?;
                Ok(parse_scoped_listing(&out))
            }
        }
    }
}

/// Parse tab/space separated `name scope` lines.
fn parse_scoped_listing(out: &str) -> Vec<ResourceRef> {
    non_empty_lines(out)
        .map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default();
            match parts.next() {
                Some(scope) => ResourceRef::scoped(name, scope),
                None => ResourceRef::named(name),
            }
        })
        .collect()
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn bucket_url(resource: &ResourceRef) -> String {
    format!("gs://{}", resource.name)
}

fn require_bucket(resource_type: ResourceType) -> BackendResult<()> {
    if resource_type == ResourceType::Bucket {
        Ok(())
    } else {
        Err(BackendError::Transport(format!(
            "no size measurement command for {resource_type}"
        )))
    }
}

struct StorageDuSummarize {
    gcloud: CommandRunner,
}

impl SizeBackend for StorageDuSummarize {
    fn name(&self) -> &'static str {
        "gcloud storage du --summarize"
    }

    fn measure(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> BackendResult<String> {
        require_bucket(resource_type)?;
        let project = format!("--project={project_id}");
        let url = bucket_url(resource);
        self.gcloud.run_checked_until(
            &["storage", "du", "--summarize", project.as_str(), url.as_str()],
            deadline,
        )
    }
}

struct GsutilDu {
    gsutil: CommandRunner,
}

impl SizeBackend for GsutilDu {
    fn name(&self) -> &'static str {
        "gsutil du -s"
    }

    fn measure(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> BackendResult<String> {
        require_bucket(resource_type)?;
        let url = bucket_url(resource);
        self.gsutil
            .run_checked_until(&["-u", project_id, "du", "-s", url.as_str()], deadline)
    }

    fn check_available(&self) -> BackendResult<()> {
        self.gsutil.run_checked(&["version"]).map(|_| ())
    }
}

struct GcloudDescribe {
    gcloud: CommandRunner,
}

impl MetadataBackend for GcloudDescribe {
    fn describe(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        resource: &ResourceRef,
        deadline: Instant,
    ) -> BackendResult<Value> {
        let project = format!("--project={project_id}");
        let scope = resource.scope.as_deref().unwrap_or_default();
        let zone = format!("--zone={scope}");
        let location = format!("--location={scope}");
        let url = bucket_url(resource);

        let args: Vec<&str> = match resource_type {
            ResourceType::Bucket => {
                vec![
                    "storage",
                    "buckets",
                    "describe",
                    url.as_str(),
                    project.as_str(),
                    "--format=json",
                ]
            }
            ResourceType::Disk => vec![
                "compute",
                "disks",
                "describe",
                resource.name.as_str(),
                zone.as_str(),
                project.as_str(),
                "--format=json",
            ],
            ResourceType::FileShare => vec![
                "filestore",
                "instances",
                "describe",
                resource.name.as_str(),
                location.as_str(),
                project.as_str(),
                "--format=json",
            ],
        };

        let out = self.gcloud.run_checked_until(&args, deadline)?;
        serde_json::from_str(&out).map_err(|e| {
            BackendError::Transport(format!(
                "describe {} returned invalid JSON: {e}",
                resource.name
            ))
        })
    }
}
