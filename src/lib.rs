#![forbid(unsafe_code)]

//! Cloud Storage Audit (csa): inventories storage resources across cloud
//! projects and reports per-resource and aggregate sizes.
//!
//! One audit pass:
//! 1. **Project selection** - list accessible projects, apply include/exclude globs
//! 2. **Probing** - measure every bucket, disk and file share under a bounded worker pool
//! 3. **Reporting** - stream one CSV row per resource and fold grand totals
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use cloud_storage_audit::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use cloud_storage_audit::core::config::Config;
//! use cloud_storage_audit::inventory::pool::{PoolConfig, WorkerPool};
//! ```

pub mod prelude;

pub mod backend;
pub mod core;
pub mod inventory;
pub mod logger;
pub mod progress;
pub mod report;
