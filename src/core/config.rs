//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{AuditError, Result};
use crate::inventory::filter::validate_pattern;
use crate::inventory::record::ResourceType;

/// Full CSA configuration model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub audit: AuditConfig,
    pub projects: ProjectsConfig,
    pub resources: ResourcesConfig,
    pub backend: BackendConfig,
    pub output: OutputConfig,
}

/// How a resource type whose API is disabled in a project is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledApiPolicy {
    /// Treat as zero resources; the skip is counted in the summary.
    #[default]
    Zero,
    /// Count as an enumeration failure.
    Error,
}

/// Scan scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Ceiling on probes executing at once within one project.
    pub concurrency_limit: usize,
    /// Slots that must free up after the ceiling is hit before new probes are
    /// admitted. Zero means half the ceiling.
    pub release_batch: usize,
    /// Projects scanned at the same time.
    pub project_parallelism: usize,
    /// Deadline for each backend attempt inside a probe.
    pub probe_timeout_secs: u64,
    pub disabled_api_policy: DisabledApiPolicy,
}

/// Project selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectsConfig {
    /// Project-id patterns to scan; empty means every listed project.
    pub include: Vec<String>,
    /// Project-id patterns to skip, applied after `include`.
    pub exclude: Vec<String>,
}

/// Resource type toggles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourcesConfig {
    pub buckets: bool,
    pub disks: bool,
    pub file_shares: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Gcloud,
    Fixture,
}

/// Which backends answer inventory and size queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub gcloud_bin: PathBuf,
    pub gsutil_bin: PathBuf,
    /// Inventory document for the fixture backend.
    pub fixture_path: Option<PathBuf>,
    /// Hard deadline for a single external command; the child is killed after it.
    pub command_timeout_secs: u64,
}

/// Report and log destinations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// CSV report path; unset means a timestamped file in the working directory.
    pub csv_path: Option<PathBuf>,
    pub jsonl_log: PathBuf,
    pub jsonl_fallback: Option<PathBuf>,
    /// Render a live progress line on stderr.
    pub progress: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            release_batch: 0,
            project_parallelism: 1,
            probe_timeout_secs: 300,
            disabled_api_policy: DisabledApiPolicy::Zero,
        }
    }
}

impl AuditConfig {
    /// Batch size the admission gate waits for after the ceiling is hit.
    #[must_use]
    pub fn effective_release_batch(&self) -> usize {
        if self.release_batch == 0 {
            (self.concurrency_limit / 2).max(1)
        } else {
            self.release_batch
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            buckets: true,
            disks: true,
            file_shares: true,
        }
    }
}

impl ResourcesConfig {
    /// Enabled resource types in canonical order.
    #[must_use]
    pub fn enabled_types(&self) -> Vec<ResourceType> {
        ResourceType::ALL
            .into_iter()
            .filter(|t| match t {
                ResourceType::Bucket => self.buckets,
                ResourceType::Disk => self.disks,
                ResourceType::FileShare => self.file_shares,
            })
            .collect()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Gcloud,
            gcloud_bin: PathBuf::from("gcloud"),
            gsutil_bin: PathBuf::from("gsutil"),
            fixture_path: None,
            command_timeout_secs: 300,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            jsonl_log: data_dir().join("activity.jsonl"),
            jsonl_fallback: None,
            progress: true,
        }
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            eprintln!("[CSA-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
            PathBuf::from("/tmp")
        },
        PathBuf::from,
    )
}

fn data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("csa")
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        home_dir().join(".config").join("csa").join("config.toml")
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf)
                .map_err(|source| AuditError::io(&path_buf, source))?;
            toml::from_str(&raw)?
        } else if path.is_some() {
            return Err(AuditError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a over canonical JSON, stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // audit
        set_from(&mut lookup, "CSA_CONCURRENCY_LIMIT", &mut self.audit.concurrency_limit)?;
        set_from(&mut lookup, "CSA_RELEASE_BATCH", &mut self.audit.release_batch)?;
        set_from(
            &mut lookup,
            "CSA_PROJECT_PARALLELISM",
            &mut self.audit.project_parallelism,
        )?;
        set_from(&mut lookup, "CSA_PROBE_TIMEOUT_SECS", &mut self.audit.probe_timeout_secs)?;
        if let Some(raw) = lookup("CSA_DISABLED_API_POLICY") {
            self.audit.disabled_api_policy = match raw.trim().to_ascii_lowercase().as_str() {
                "zero" => DisabledApiPolicy::Zero,
                "error" => DisabledApiPolicy::Error,
                other => {
                    return Err(AuditError::ConfigParse {
                        context: "env",
                        details: format!("CSA_DISABLED_API_POLICY={other:?}: expected zero|error"),
                    });
                }
            };
        }

        // projects
        if let Some(raw) = lookup("CSA_PROJECTS_INCLUDE") {
            self.projects.include = split_list(&raw);
        }
        if let Some(raw) = lookup("CSA_PROJECTS_EXCLUDE") {
            self.projects.exclude = split_list(&raw);
        }

        // resources
        set_from(&mut lookup, "CSA_SCAN_BUCKETS", &mut self.resources.buckets)?;
        set_from(&mut lookup, "CSA_SCAN_DISKS", &mut self.resources.disks)?;
        set_from(&mut lookup, "CSA_SCAN_FILE_SHARES", &mut self.resources.file_shares)?;

        // backend
        if let Some(raw) = lookup("CSA_BACKEND") {
            self.backend.kind = match raw.trim().to_ascii_lowercase().as_str() {
                "gcloud" => BackendKind::Gcloud,
                "fixture" => BackendKind::Fixture,
                other => {
                    return Err(AuditError::ConfigParse {
                        context: "env",
                        details: format!("CSA_BACKEND={other:?}: expected gcloud|fixture"),
                    });
                }
            };
        }
        if let Some(raw) = lookup("CSA_GCLOUD_BIN") {
            self.backend.gcloud_bin = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("CSA_GSUTIL_BIN") {
            self.backend.gsutil_bin = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("CSA_FIXTURE_PATH") {
            self.backend.fixture_path = Some(PathBuf::from(raw));
        }
        set_from(
            &mut lookup,
            "CSA_COMMAND_TIMEOUT_SECS",
            &mut self.backend.command_timeout_secs,
        )?;

        // output
        if let Some(raw) = lookup("CSA_CSV_PATH") {
            self.output.csv_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("CSA_JSONL_LOG") {
            self.output.jsonl_log = PathBuf::from(raw);
        }
        set_from(&mut lookup, "CSA_PROGRESS", &mut self.output.progress)?;

        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let audit = &self.audit;
        if audit.concurrency_limit == 0 {
            return Err(invalid("audit.concurrency_limit must be >= 1"));
        }
        if audit.release_batch > audit.concurrency_limit {
            return Err(invalid(format!(
                "audit.release_batch ({}) must not exceed audit.concurrency_limit ({})",
                audit.release_batch, audit.concurrency_limit
            )));
        }
        if audit.project_parallelism == 0 {
            return Err(invalid("audit.project_parallelism must be >= 1"));
        }
        if audit.probe_timeout_secs == 0 {
            return Err(invalid("audit.probe_timeout_secs must be >= 1"));
        }
        if self.backend.command_timeout_secs == 0 {
            return Err(invalid("backend.command_timeout_secs must be >= 1"));
        }
        if self.backend.command_timeout_secs > audit.probe_timeout_secs {
            return Err(invalid(format!(
                "backend.command_timeout_secs ({}) must not exceed audit.probe_timeout_secs ({})",
                self.backend.command_timeout_secs, audit.probe_timeout_secs
            )));
        }
        if self.resources.enabled_types().is_empty() {
            return Err(invalid("at least one resource type must be enabled"));
        }
        if self.backend.kind == BackendKind::Fixture && self.backend.fixture_path.is_none() {
            return Err(invalid(
                "backend.fixture_path is required when backend.kind = \"fixture\"",
            ));
        }
        for pattern in self.projects.include.iter().chain(&self.projects.exclude) {
            validate_pattern(pattern)?;
        }
        Ok(())
    }
}

fn invalid(details: impl Into<String>) -> AuditError {
    AuditError::InvalidConfig {
        details: details.into(),
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn set_from<F, T>(lookup: &mut F, name: &str, slot: &mut T) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse::<T>().map_err(|error| AuditError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{AuditError, BackendKind, Config, DisabledApiPolicy};
    use crate::inventory::record::ResourceType;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    fn apply(cfg: &mut Config, pairs: &[(&str, &str)]) -> crate::core::errors::Result<()> {
        let env = vars(pairs);
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.audit.concurrency_limit, 10);
        assert_eq!(cfg.audit.effective_release_batch(), 5);
        assert_eq!(cfg.resources.enabled_types(), ResourceType::ALL.to_vec());
    }

    #[test]
    fn release_batch_never_below_one() {
        let mut cfg = Config::default();
        cfg.audit.concurrency_limit = 1;
        assert_eq!(cfg.audit.effective_release_batch(), 1);
        cfg.audit.release_batch = 1;
        assert_eq!(cfg.audit.effective_release_batch(), 1);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut cfg = Config::default();
        cfg.audit.concurrency_limit = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("concurrency_limit"));
    }

    #[test]
    fn release_batch_above_ceiling_rejected() {
        let mut cfg = Config::default();
        cfg.audit.release_batch = 11;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn command_timeout_longer_than_probe_timeout_rejected() {
        let mut cfg = Config::default();
        cfg.audit.probe_timeout_secs = 60;
        cfg.backend.command_timeout_secs = 61;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CSA-1001");
        assert!(err.to_string().contains("command_timeout_secs"));
        cfg.backend.command_timeout_secs = 60;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn all_resource_types_disabled_rejected() {
        let mut cfg = Config::default();
        cfg.resources.buckets = false;
        cfg.resources.disks = false;
        cfg.resources.file_shares = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fixture_backend_requires_path() {
        let mut cfg = Config::default();
        cfg.backend.kind = BackendKind::Fixture;
        assert!(cfg.validate().is_err());
        cfg.backend.fixture_path = Some(PathBuf::from("/tmp/inventory.json"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn blank_project_pattern_rejected() {
        let mut cfg = Config::default();
        cfg.projects.exclude = vec!["  ".to_string()];
        assert_eq!(cfg.validate().unwrap_err().code(), "CSA-1001");
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        apply(
            &mut cfg,
            &[
                ("CSA_CONCURRENCY_LIMIT", "32"),
                ("CSA_DISABLED_API_POLICY", "error"),
                ("CSA_PROJECTS_INCLUDE", "prod-*, staging-*"),
                ("CSA_SCAN_FILE_SHARES", "false"),
                ("CSA_BACKEND", "fixture"),
                ("CSA_FIXTURE_PATH", "/tmp/inv.json"),
            ],
        )
        .unwrap();
        assert_eq!(cfg.audit.concurrency_limit, 32);
        assert_eq!(cfg.audit.disabled_api_policy, DisabledApiPolicy::Error);
        assert_eq!(cfg.projects.include, vec!["prod-*", "staging-*"]);
        assert!(!cfg.resources.file_shares);
        assert_eq!(cfg.backend.kind, BackendKind::Fixture);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let err = apply(&mut cfg, &[("CSA_CONCURRENCY_LIMIT", "many")]).unwrap_err();
        assert!(matches!(err, AuditError::ConfigParse { context: "env", .. }));
        assert!(err.to_string().contains("CSA_CONCURRENCY_LIMIT"));
    }

    #[test]
    fn env_invalid_backend_rejected() {
        let mut cfg = Config::default();
        assert!(apply(&mut cfg, &[("CSA_BACKEND", "s3")]).is_err());
    }

    #[test]
    fn toml_sections_parse_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [audit]
            concurrency_limit = 4
            disabled_api_policy = "error"

            [resources]
            file_shares = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.audit.concurrency_limit, 4);
        assert_eq!(cfg.audit.probe_timeout_secs, 300);
        assert_eq!(
            cfg.resources.enabled_types(),
            vec![ResourceType::Bucket, ResourceType::Disk]
        );
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audit]\nproject_parallelism = 3\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.audit.project_parallelism, 3);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/csa/config.toml"))).unwrap_err();
        assert!(matches!(err, AuditError::MissingConfig { .. }));
    }

    #[test]
    fn stable_hash_tracks_changes() {
        let cfg = Config::default();
        let h1 = cfg.stable_hash().unwrap();
        assert_eq!(h1, cfg.stable_hash().unwrap());
        let mut other = cfg.clone();
        other.audit.concurrency_limit = 11;
        assert_ne!(h1, other.stable_hash().unwrap());
    }
}
