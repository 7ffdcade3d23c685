//! Chronological k-way merge over open journals.
//!
//! At load time every journal with pending records joins the merge set;
//! the replay driver repeatedly takes the globally oldest unconsumed
//! record and applies it. Ties are broken by stream ordinal (database
//! journal first, then cubes in discovery order), which is stable across
//! loads, so replay is deterministic.
//!
//! Bulk-framed sections (`BULK_START` ... `BULK_STOP`) are buffered per
//! stream and handed out as one unit when the stop marker is consumed, so
//! the expensive structural recompute runs once per bulk instead of once
//! per record. A journal may be added mid-merge: a replayed `CREATE_CUBE`
//! opens the new cube's journal and its records join the ordering from
//! then on.

use std::collections::VecDeque;

use tracing::warn;

use super::{Command, Record};

/// One unit of replay work.
#[derive(Debug, PartialEq)]
pub enum ReplayItem {
    /// An ordinary record from the stream with the given ordinal.
    Single(usize, Record),
    /// A complete bulk section, to be applied as an isolated sub-journal.
    Bulk(usize, Vec<Record>),
}

struct Stream {
    records: VecDeque<Record>,
    /// Buffer of an open bulk frame, if the stream is inside one.
    bulk: Option<Vec<Record>>,
}

/// Merges any number of record streams in global timestamp order.
#[derive(Default)]
pub struct ChronologicalMerge {
    streams: Vec<Stream>,
}

impl ChronologicalMerge {
    pub fn new() -> ChronologicalMerge {
        return ChronologicalMerge { streams: Vec::new() };
    }

    /// Add a stream; returns its ordinal (the tie-break rank).
    pub fn add_stream(&mut self, records: Vec<Record>) -> usize {
        let ordinal = self.streams.len();
        self.streams.push(Stream { records: records.into(), bulk: None });
        return ordinal;
    }

    /// Index of the stream holding the globally oldest pending record.
    fn oldest(&self) -> Option<usize> {
        let mut best: Option<(usize, chrono::DateTime<chrono::Utc>)> = None;
        for (ordinal, stream) in self.streams.iter().enumerate() {
            let Some(head) = stream.records.front() else { continue };
            match best {
                Some((_, time)) if head.time >= time => {}
                _ => best = Some((ordinal, head.time)),
            }
        }
        return best.map(|(ordinal, _)| ordinal);
    }

    /// The next unit of work, or `None` when every stream is drained.
    pub fn next_item(&mut self) -> Option<ReplayItem> {
        loop {
            let Some(ordinal) = self.oldest() else {
                return self.drain_unterminated_bulk();
            };
            let stream = &mut self.streams[ordinal];
            let record = stream
                .records
                .pop_front()
                .unwrap_or_else(|| unreachable!("oldest() returned an empty stream"));
            match (&mut stream.bulk, record.command) {
                (None, Command::BulkStart) => {
                    stream.bulk = Some(Vec::new());
                }
                (None, _) => {
                    return Some(ReplayItem::Single(ordinal, record));
                }
                (Some(_), Command::BulkStop) => {
                    let bulk = stream.bulk.take().unwrap_or_else(|| unreachable!());
                    return Some(ReplayItem::Bulk(ordinal, bulk));
                }
                (Some(_), Command::BulkStart) => {
                    warn!(ordinal, "nested BULK_START in journal, ignoring");
                }
                (Some(bulk), _) => {
                    bulk.push(record);
                }
            }
        }
    }

    /// A crash can leave a bulk frame without its stop marker; the
    /// buffered prefix is still chronologically sound, so apply it.
    fn drain_unterminated_bulk(&mut self) -> Option<ReplayItem> {
        for (ordinal, stream) in self.streams.iter_mut().enumerate() {
            if let Some(bulk) = stream.bulk.take() {
                if !bulk.is_empty() {
                    warn!(ordinal, "journal ends inside a bulk section, applying partial bulk");
                    return Some(ReplayItem::Bulk(ordinal, bulk));
                }
            }
        }
        return None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TransactionContext;
    use chrono::{TimeZone, Utc};

    fn record(seconds: i64, command: Command, field: &str) -> Record {
        let ctx = TransactionContext::new("alice", "test");
        let mut record = Record::new(&ctx, command, vec![field.to_string()]);
        record.time = Utc.timestamp_opt(seconds, 0).unwrap();
        return record;
    }

    fn field_of(item: &ReplayItem) -> String {
        match item {
            ReplayItem::Single(_, record) => return record.fields[0].clone(),
            ReplayItem::Bulk(..) => panic!("expected single"),
        }
    }

    #[test]
    fn merges_by_timestamp_across_streams() {
        let mut merge = ChronologicalMerge::new();
        merge.add_stream(vec![
            record(1, Command::CreateElement, "a"),
            record(4, Command::CreateElement, "d"),
        ]);
        merge.add_stream(vec![
            record(2, Command::CreateElement, "b"),
            record(3, Command::CreateElement, "c"),
        ]);

        let mut order = Vec::new();
        while let Some(item) = merge.next_item() {
            order.push(field_of(&item));
        }
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn ties_break_by_ordinal() {
        let mut merge = ChronologicalMerge::new();
        merge.add_stream(vec![record(1, Command::CreateElement, "first")]);
        merge.add_stream(vec![record(1, Command::CreateElement, "second")]);

        assert_eq!(field_of(&merge.next_item().unwrap()), "first");
        assert_eq!(field_of(&merge.next_item().unwrap()), "second");
    }

    #[test]
    fn bulk_sections_come_out_whole() {
        let mut merge = ChronologicalMerge::new();
        merge.add_stream(vec![
            record(1, Command::BulkStart, ""),
            record(2, Command::CreateElement, "x"),
            record(5, Command::CreateElement, "y"),
            record(6, Command::BulkStop, ""),
        ]);
        // A record from another journal lands inside the bulk's time span.
        merge.add_stream(vec![record(3, Command::CreateElement, "outside")]);

        let first = merge.next_item().unwrap();
        assert_eq!(field_of(&first), "outside");
        match merge.next_item().unwrap() {
            ReplayItem::Bulk(0, records) => {
                let fields: Vec<&str> = records.iter().map(|r| r.fields[0].as_str()).collect();
                assert_eq!(fields, vec!["x", "y"]);
            }
            other => panic!("expected bulk, got {other:?}"),
        }
        assert_eq!(merge.next_item(), None);
    }

    #[test]
    fn unterminated_bulk_is_applied() {
        let mut merge = ChronologicalMerge::new();
        merge.add_stream(vec![
            record(1, Command::BulkStart, ""),
            record(2, Command::CreateElement, "x"),
        ]);
        match merge.next_item().unwrap() {
            ReplayItem::Bulk(0, records) => assert_eq!(records.len(), 1),
            other => panic!("expected bulk, got {other:?}"),
        }
        assert_eq!(merge.next_item(), None);
    }

    #[test]
    fn streams_added_mid_merge_participate() {
        let mut merge = ChronologicalMerge::new();
        merge.add_stream(vec![
            record(1, Command::CreateCube, "cube"),
            record(5, Command::CreateElement, "late"),
        ]);
        assert_eq!(field_of(&merge.next_item().unwrap()), "cube");

        // The cube's own journal joins now.
        merge.add_stream(vec![record(2, Command::CreateElement, "early")]);
        assert_eq!(field_of(&merge.next_item().unwrap()), "early");
        assert_eq!(field_of(&merge.next_item().unwrap()), "late");
    }
}
