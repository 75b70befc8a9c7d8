//! The partition stencil.

use rdsys_api::{DynResource, Resource};
use std::collections::BTreeMap;

/// A numerical interval labelled with a partition name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Interval {
    pub begin: i64,
    pub end: i64,
    pub name: String,
}

impl Interval {
    /// Whether the given number n falls into the interval [begin, end]
    /// so that begin <= n <= end.
    fn contains(&self, n: i64) -> bool {
        self.begin <= n && n <= self.end
    }
}

/// A chain of intervals that partitions hashrings.
///
/// Distributor-specific stencils make it easy to deterministically
/// select non-overlapping subsets of a hashring that should be given to
/// a distributor: the configured proportions become consecutive
/// intervals, ordered by partition name so the assignment is
/// reproducible across restarts and across processes without
/// coordination.
#[derive(Debug, Clone, Default)]
pub struct Stencil {
    intervals: Vec<Interval>,
}

impl Stencil {
    /// Turn partition proportions into an interval chain. A `BTreeMap`
    /// iterates its keys in lexicographic order, which is what makes
    /// the interval layout deterministic.
    pub fn build(proportions: &BTreeMap<String, u32>) -> Self {
        let mut stencil = Stencil::default();
        let mut i: i64 = 0;
        for (name, weight) in proportions {
            stencil.add_interval(Interval {
                begin: i,
                end: i + *weight as i64 - 1,
                name: name.clone(),
            });
            i += *weight as i64;
        }
        stencil
    }

    pub(crate) fn add_interval(&mut self, interval: Interval) {
        self.intervals.push(interval);
    }

    /// The interval that the given number falls into, if any.
    pub(crate) fn find_by_value(&self, n: i64) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.contains(n))
    }

    /// The maximum end over all intervals of the stencil. `None` for an
    /// empty stencil.
    pub(crate) fn upper_end(&self) -> Option<i64> {
        self.intervals.iter().map(|i| i.end).max()
    }

    /// The partition the given resource maps to: the resource's unique
    /// id, reduced modulo the stencil width, selects the covering
    /// interval.
    pub fn partition_name(&self, r: &DynResource) -> Option<&str> {
        let upper_end = self.upper_end()?;
        if upper_end < 0 {
            return None;
        }
        let n = (r.uid().0 % (upper_end as u64 + 1)) as i64;
        match self.find_by_value(n) {
            Some(interval) => Some(&interval.name),
            None => {
                tracing::error!(
                    "Bug: resource {:?} does not fall in any interval.",
                    r.string_form(),
                );
                None
            }
        }
    }
}
