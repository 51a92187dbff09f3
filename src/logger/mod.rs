//! Activity logging: JSONL writer owned by a dedicated logger thread.

pub mod activity;
pub mod jsonl;
