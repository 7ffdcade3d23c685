//! Sparse weighted sets of base elements.
//!
//! A consolidated element's value is the weighted sum of its leaf
//! descendants. The flattened leaf-to-weight mapping is cached on every
//! consolidated element, so the representation matters: dimensions are
//! commonly created by bulk loads that assign consecutive ids, which means
//! long runs of adjacent ids carrying the same weight. Key design decisions:
//!
//! 1. **Run compression**: the set is a sorted vector of `(first, last,
//!    weight)` runs rather than one entry per id. A thousand consecutive
//!    leaves with weight 1.0 cost one run.
//!
//! 2. **Linear merges**: additive and subtractive merge walk both run
//!    vectors with two cursors, splitting runs only at boundaries where the
//!    operands disagree. O(runs), never O(ids).
//!
//! 3. **Exact zero elision**: subtracting a contribution that was
//!    previously added removes the entry entirely (the weights are the same
//!    doubles, so the difference is exactly zero).

use crate::element::ElementId;

/// A maximal range of consecutive element ids sharing one weight.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Run {
    first: u64,
    last: u64,
    weight: f64,
}

impl Run {
    fn len(&self) -> u64 {
        return self.last - self.first + 1;
    }
}

/// Sparse mapping from base-element id to contribution weight.
#[derive(Clone, Debug, Default)]
pub struct WeightedSet {
    /// Sorted by `first`, non-overlapping, non-empty, no zero weights.
    runs: Vec<Run>,
}

impl WeightedSet {
    pub fn new() -> WeightedSet {
        return WeightedSet { runs: Vec::new() };
    }

    /// Build from `(id, weight)` pairs. Pairs need not be sorted; repeated
    /// ids sum their weights.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ElementId, f64)>) -> WeightedSet {
        let mut set = WeightedSet::new();
        for (id, weight) in pairs {
            set.add(id, weight);
        }
        return set;
    }

    /// Number of ids carrying a non-zero weight.
    pub fn len(&self) -> u64 {
        return self.runs.iter().map(Run::len).sum();
    }

    pub fn is_empty(&self) -> bool {
        return self.runs.is_empty();
    }

    /// Number of compressed runs. Exposed for compaction diagnostics.
    pub fn run_count(&self) -> usize {
        return self.runs.len();
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    /// Weight carried by `id`, or `None` if the id does not contribute.
    pub fn get(&self, id: ElementId) -> Option<f64> {
        let raw = id.raw();
        let i = self.runs.partition_point(|run| run.last < raw);
        match self.runs.get(i) {
            Some(run) if run.first <= raw => return Some(run.weight),
            _ => return None,
        }
    }

    /// Set `id` to exactly `weight`, replacing any previous contribution.
    pub fn set(&mut self, id: ElementId, weight: f64) {
        self.remove(id);
        if weight != 0.0 {
            self.insert_run(Run { first: id.raw(), last: id.raw(), weight });
        }
    }

    /// Add `weight` to `id`'s current contribution.
    pub fn add(&mut self, id: ElementId, weight: f64) {
        let current = self.get(id).unwrap_or(0.0);
        self.set(id, current + weight);
    }

    /// Remove `id`'s contribution, splitting the containing run if needed.
    pub fn remove(&mut self, id: ElementId) {
        let raw = id.raw();
        let i = self.runs.partition_point(|run| run.last < raw);
        let Some(run) = self.runs.get(i).copied() else { return };
        if run.first > raw {
            return;
        }
        if run.first == raw && run.last == raw {
            self.runs.remove(i);
        } else if run.first == raw {
            self.runs[i].first = raw + 1;
        } else if run.last == raw {
            self.runs[i].last = raw - 1;
        } else {
            // Interior removal splits the run in two.
            self.runs[i].last = raw - 1;
            self.runs.insert(i + 1, Run { first: raw + 1, last: run.last, weight: run.weight });
        }
    }

    /// Additive merge: `self[id] += factor * other[id]` for every id in
    /// `other`. `factor` is the consolidation edge weight.
    pub fn add_scaled(&mut self, other: &WeightedSet, factor: f64) {
        self.combine(other, factor);
    }

    /// Subtractive merge: undo a prior `add_scaled` with the same factor.
    pub fn sub_scaled(&mut self, other: &WeightedSet, factor: f64) {
        self.combine(other, -factor);
    }

    /// Merge adjacent runs whose id ranges touch and whose weights match.
    /// Called after bulk rebuilds; the incremental paths keep runs valid
    /// but not necessarily maximal.
    pub fn compact(&mut self) {
        let mut out: Vec<Run> = Vec::with_capacity(self.runs.len());
        for run in self.runs.drain(..) {
            match out.last_mut() {
                Some(prev) if prev.last + 1 == run.first && prev.weight == run.weight => {
                    prev.last = run.last;
                }
                _ => out.push(run),
            }
        }
        self.runs = out;
    }

    /// Iterate `(id, weight)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (ElementId, f64)> + '_ {
        return self
            .runs
            .iter()
            .flat_map(|run| (run.first..=run.last).map(move |raw| (ElementId::new(raw), run.weight)));
    }

    fn insert_run(&mut self, run: Run) {
        let i = self.runs.partition_point(|r| r.last < run.first);
        self.runs.insert(i, run);
    }

    /// Two-cursor linear merge over both run vectors. Runs are split at
    /// every boundary where the operands disagree; exact zeros are dropped.
    fn combine(&mut self, other: &WeightedSet, factor: f64) {
        if other.runs.is_empty() || factor == 0.0 {
            return;
        }
        let ours = std::mem::take(&mut self.runs);
        let mut out: Vec<Run> = Vec::with_capacity(ours.len() + other.runs.len());
        let mut a = ours.iter().copied().peekable();
        let mut b = other.runs.iter().map(|run| Run { weight: run.weight * factor, ..*run }).peekable();

        let mut push = |run: Run| {
            if run.weight == 0.0 {
                return;
            }
            match out.last_mut() {
                Some(prev) if prev.last + 1 == run.first && prev.weight == run.weight => {
                    prev.last = run.last;
                }
                _ => out.push(run),
            }
        };

        loop {
            match (a.peek().copied(), b.peek().copied()) {
                (None, None) => break,
                (Some(run), None) => {
                    push(run);
                    a.next();
                }
                (None, Some(run)) => {
                    push(run);
                    b.next();
                }
                (Some(x), Some(y)) => {
                    if x.last < y.first {
                        push(x);
                        a.next();
                    } else if y.last < x.first {
                        push(y);
                        b.next();
                    } else if x.first < y.first {
                        // Leading non-overlapping fragment of x.
                        push(Run { first: x.first, last: y.first - 1, weight: x.weight });
                        a.peek_mut().unwrap().first = y.first;
                    } else if y.first < x.first {
                        push(Run { first: y.first, last: x.first - 1, weight: y.weight });
                        b.peek_mut().unwrap().first = x.first;
                    } else {
                        // Aligned starts: emit the overlapping sum.
                        let end = x.last.min(y.last);
                        push(Run { first: x.first, last: end, weight: x.weight + y.weight });
                        if x.last == end { a.next(); } else { a.peek_mut().unwrap().first = end + 1; }
                        if y.last == end { b.next(); } else { b.peek_mut().unwrap().first = end + 1; }
                    }
                }
            }
        }
        self.runs = out;
    }
}

impl PartialEq for WeightedSet {
    /// Logical equality over `(id, weight)` content, independent of how the
    /// runs happen to be split.
    fn eq(&self, other: &WeightedSet) -> bool {
        let mut compacted_self = self.clone();
        let mut compacted_other = other.clone();
        compacted_self.compact();
        compacted_other.compact();
        return compacted_self.runs == compacted_other.runs;
    }
}

impl FromIterator<(ElementId, f64)> for WeightedSet {
    fn from_iter<I: IntoIterator<Item = (ElementId, f64)>>(iter: I) -> WeightedSet {
        return WeightedSet::from_pairs(iter);
    }
}
