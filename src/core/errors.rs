//! CSA-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, AuditError>;

/// Top-level error type for the storage audit.
///
/// Only audit-level failures live here. Per-resource failures are recovered
/// into a [`ProbeIssue`](crate::inventory::record::ProbeIssue) on the record.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("[CSA-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CSA-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CSA-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CSA-1101] setup failure: {details}")]
    Setup { details: String },

    #[error("[CSA-1102] no accessible projects: {details}")]
    NoProjects { details: String },

    #[error("[CSA-1103] backend {backend} unavailable: {details}")]
    BackendUnavailable {
        backend: &'static str,
        details: String,
    },

    #[error("[CSA-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CSA-2201] report write failure in {sink}: {details}")]
    ReportWrite { sink: &'static str, details: String },

    #[error("[CSA-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CSA-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[CSA-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl AuditError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CSA-1001",
            Self::MissingConfig { .. } => "CSA-1002",
            Self::ConfigParse { .. } => "CSA-1003",
            Self::Setup { .. } => "CSA-1101",
            Self::NoProjects { .. } => "CSA-1102",
            Self::BackendUnavailable { .. } => "CSA-1103",
            Self::Serialization { .. } => "CSA-2101",
            Self::ReportWrite { .. } => "CSA-2201",
            Self::Io { .. } => "CSA-3002",
            Self::ChannelClosed { .. } => "CSA-3003",
            Self::Runtime { .. } => "CSA-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::BackendUnavailable { .. }
                | Self::ReportWrite { .. }
                | Self::Runtime { .. }
        )
    }

    /// Whether the audit could not start scanning at all.
    #[must_use]
    pub const fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Self::Setup { .. } | Self::NoProjects { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for AuditError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<AuditError> {
        vec![
            AuditError::InvalidConfig {
                details: String::new(),
            },
            AuditError::MissingConfig {
                path: PathBuf::new(),
            },
            AuditError::ConfigParse {
                context: "",
                details: String::new(),
            },
            AuditError::Setup {
                details: String::new(),
            },
            AuditError::NoProjects {
                details: String::new(),
            },
            AuditError::BackendUnavailable {
                backend: "",
                details: String::new(),
            },
            AuditError::Serialization {
                context: "",
                details: String::new(),
            },
            AuditError::ReportWrite {
                sink: "",
                details: String::new(),
            },
            AuditError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            AuditError::ChannelClosed { component: "" },
            AuditError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(AuditError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_codes_have_csa_prefix_and_appear_in_display() {
        for err in all_variants() {
            assert!(err.code().starts_with("CSA-"), "bad code {}", err.code());
            assert!(
                err.to_string().contains(err.code()),
                "display should contain code: {err}"
            );
        }
    }

    #[test]
    fn setup_failures_are_classified() {
        assert!(
            AuditError::NoProjects {
                details: "none".to_string()
            }
            .is_setup_failure()
        );
        assert!(
            AuditError::BackendUnavailable {
                backend: "gcloud",
                details: "not found".to_string()
            }
            .is_setup_failure()
        );
        assert!(
            !AuditError::ReportWrite {
                sink: "csv",
                details: String::new()
            }
            .is_setup_failure()
        );
        assert!(
            !AuditError::InvalidConfig {
                details: String::new()
            }
            .is_setup_failure()
        );
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(AuditError::ChannelClosed { component: "pool" }.is_retryable());
        assert!(
            AuditError::io("/tmp/x", std::io::Error::other("test")).is_retryable()
        );
        assert!(
            !AuditError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !AuditError::NoProjects {
                details: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = AuditError::io(
            "/tmp/report.csv",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "CSA-3002");
        assert!(err.to_string().contains("/tmp/report.csv"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: AuditError = json_err.into();
        assert_eq!(err.code(), "CSA-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: AuditError = toml_err.into();
        assert_eq!(err.code(), "CSA-1003");
    }
}
