//! Per-project aggregation and the cross-project accumulator.
//!
//! The aggregator streams every record to the report sink and folds it into
//! [`ProjectTotals`]. Error records are counted but contribute zero bytes. The
//! fold is a sum of independent counters, so arrival order does not matter.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::inventory::record::{ResourceRecord, ResourceStatus, ResourceType};
use crate::report::ReportSink;

/// Counters for one resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeTotals {
    pub total_bytes: u64,
    pub resource_count: u64,
    pub error_count: u64,
    pub empty_count: u64,
    /// Empty rows whose measurement output could not be parsed.
    pub unverified_count: u64,
    pub fallback_count: u64,
}

impl TypeTotals {
    fn observe(&mut self, record: &ResourceRecord) {
        self.resource_count += 1;
        match record.status {
            ResourceStatus::Success => {
                self.total_bytes = self.total_bytes.saturating_add(record.size_bytes);
                if record.used_fallback() {
                    self.fallback_count += 1;
                }
            }
            ResourceStatus::EmptyOrZero => {
                self.empty_count += 1;
                if record.is_unverified_empty() {
                    self.unverified_count += 1;
                }
            }
            ResourceStatus::Error => self.error_count += 1,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.total_bytes = self.total_bytes.saturating_add(other.total_bytes);
        self.resource_count += other.resource_count;
        self.error_count += other.error_count;
        self.empty_count += other.empty_count;
        self.unverified_count += other.unverified_count;
        self.fallback_count += other.fallback_count;
    }
}

/// Totals for one project, keyed by resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTotals {
    pub project_id: String,
    pub by_type: BTreeMap<ResourceType, TypeTotals>,
}

impl ProjectTotals {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            by_type: BTreeMap::new(),
        }
    }

    /// Fold one record in.
    pub fn observe(&mut self, record: &ResourceRecord) {
        self.by_type
            .entry(record.resource_type)
            .or_default()
            .observe(record);
    }

    #[must_use]
    pub fn get(&self, resource_type: ResourceType) -> TypeTotals {
        self.by_type.get(&resource_type).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.by_type.values().map(|t| t.total_bytes).sum()
    }

    #[must_use]
    pub fn resource_count(&self) -> u64 {
        self.by_type.values().map(|t| t.resource_count).sum()
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.by_type.values().map(|t| t.error_count).sum()
    }
}

/// Streams one project's records to the sink while totalling them.
pub struct ProjectAggregator<'a> {
    totals: ProjectTotals,
    sink: &'a dyn ReportSink,
}

impl<'a> ProjectAggregator<'a> {
    pub fn new(project_id: impl Into<String>, sink: &'a dyn ReportSink) -> Self {
        Self {
            totals: ProjectTotals::new(project_id),
            sink,
        }
    }

    /// Emit the row, then count it. A sink failure leaves the record uncounted.
    pub fn observe(&mut self, record: &ResourceRecord) -> Result<()> {
        self.sink.emit(record)?;
        self.totals.observe(record);
        Ok(())
    }

    #[must_use]
    pub fn finish(self) -> ProjectTotals {
        self.totals
    }
}

/// Aggregate a complete batch of records for one project.
pub fn aggregate(
    project_id: &str,
    records: &[ResourceRecord],
    sink: &dyn ReportSink,
) -> Result<ProjectTotals> {
    let mut aggregator = ProjectAggregator::new(project_id, sink);
    for record in records {
        aggregator.observe(record)?;
    }
    Ok(aggregator.finish())
}

/// Audit-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrandTotals {
    pub by_type: BTreeMap<ResourceType, TypeTotals>,
    pub projects: u64,
}

impl GrandTotals {
    fn add(&mut self, project: &ProjectTotals) {
        for (resource_type, totals) in &project.by_type {
            self.by_type.entry(*resource_type).or_default().merge(totals);
        }
        self.projects += 1;
    }

    #[must_use]
    pub fn get(&self, resource_type: ResourceType) -> TypeTotals {
        self.by_type.get(&resource_type).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.by_type.values().map(|t| t.total_bytes).sum()
    }

    #[must_use]
    pub fn resource_count(&self) -> u64 {
        self.by_type.values().map(|t| t.resource_count).sum()
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.by_type.values().map(|t| t.error_count).sum()
    }
}

/// Serializes updates to the grand totals across concurrently finishing projects.
#[derive(Default)]
pub struct Accumulator {
    totals: Mutex<GrandTotals>,
}

impl Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&self, project: &ProjectTotals) {
        self.totals.lock().add(project);
    }

    #[must_use]
    pub fn snapshot(&self) -> GrandTotals {
        self.totals.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::record::{IssueKind, ProbeIssue, ResourceRef, ScanTask, SizeSource};
    use crate::report::MemorySink;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn record(seq: usize, resource_type: ResourceType, bytes: u64, fail: bool) -> ResourceRecord {
        let task = ScanTask {
            project_id: "proj".to_string(),
            resource_type,
            resource: ResourceRef::named(format!("r{seq}")),
            sequence_index: seq,
        };
        if fail {
            ResourceRecord::failed(&task, ProbeIssue::new(IssueKind::Transport, "down"))
        } else {
            let mut r = ResourceRecord::for_task(&task);
            r.set_size(bytes, SizeSource::Primary);
            r
        }
    }

    fn sample() -> Vec<ResourceRecord> {
        vec![
            record(0, ResourceType::Bucket, 0, false),
            record(1, ResourceType::Bucket, 5_000_000_000, false),
            record(2, ResourceType::Disk, 100 << 30, false),
            record(3, ResourceType::Bucket, 0, true),
        ]
    }

    #[test]
    fn totals_group_by_type_and_count_errors_as_zero() {
        let sink = MemorySink::new();
        let totals = aggregate("proj", &sample(), &sink).unwrap();
        let buckets = totals.get(ResourceType::Bucket);
        assert_eq!(buckets.total_bytes, 5_000_000_000);
        assert_eq!(buckets.resource_count, 3);
        assert_eq!(buckets.error_count, 1);
        assert_eq!(buckets.empty_count, 1);
        assert_eq!(totals.get(ResourceType::Disk).total_bytes, 100 << 30);
        assert_eq!(totals.get(ResourceType::FileShare), TypeTotals::default());
        assert_eq!(totals.resource_count(), 4);
    }

    #[test]
    fn every_record_is_emitted_in_order() {
        let sink = MemorySink::new();
        aggregate("proj", &sample(), &sink).unwrap();
        let seqs: Vec<usize> = sink.records().iter().map(|r| r.sequence_index).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn double_accumulation_halves_to_single() {
        let sink = MemorySink::new();
        let totals = aggregate("proj", &sample(), &sink).unwrap();

        let single = Accumulator::new();
        single.accumulate(&totals);
        let double = Accumulator::new();
        double.accumulate(&totals);
        double.accumulate(&totals);

        let single = single.snapshot();
        let double = double.snapshot();
        for resource_type in ResourceType::ALL {
            let s = single.get(resource_type);
            let d = double.get(resource_type);
            assert_eq!(d.total_bytes / 2, s.total_bytes);
            assert_eq!(d.resource_count / 2, s.resource_count);
            assert_eq!(d.error_count / 2, s.error_count);
        }
        assert_eq!(double.projects / 2, single.projects);
    }

    #[test]
    fn concurrent_accumulation_loses_no_updates() {
        let sink = MemorySink::new();
        let totals = aggregate("proj", &sample(), &sink).unwrap();
        let acc = Arc::new(Accumulator::new());
        thread::scope(|s| {
            for _ in 0..8 {
                let acc = Arc::clone(&acc);
                let totals = &totals;
                s.spawn(move || {
                    for _ in 0..50 {
                        acc.accumulate(totals);
                    }
                });
            }
        });
        let snap = acc.snapshot();
        assert_eq!(snap.projects, 400);
        assert_eq!(snap.get(ResourceType::Bucket).total_bytes, 400 * 5_000_000_000);
    }

    fn arb_record() -> impl Strategy<Value = ResourceRecord> {
        (
            0..3usize,
            0..10_000_000_000u64,
            any::<bool>(),
            any::<usize>(),
        )
            .prop_map(|(t, bytes, fail, seq)| {
                record(seq, ResourceType::ALL[t], bytes, fail)
            })
    }

    proptest! {
        #[test]
        fn totals_ignore_arrival_order(
            (records, shuffled) in prop::collection::vec(arb_record(), 0..40)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            let sink = MemorySink::new();
            let a = aggregate("proj", &records, &sink).unwrap();
            let b = aggregate("proj", &shuffled, &sink).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
