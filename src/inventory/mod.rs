//! Scan engine: records, probing, scheduling, aggregation and the audit pass.

pub mod aggregate;
pub mod audit;
pub mod filter;
pub mod metadata;
pub mod parse;
pub mod pool;
pub mod probe;
pub mod record;
