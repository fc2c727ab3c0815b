//! Splits a fetched batch into inserts and updates by dedup key.

use std::collections::{HashMap, HashSet};

use msync_core::{DedupKey, MetricRecord};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub to_insert: Vec<MetricRecord>,
    pub to_update: Vec<MetricRecord>,
    /// Rows in the batch superseded by a later row with the same key.
    pub superseded: usize,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty()
    }
}

/// Stages every fresh record as an insert, or as an update when its key is already stored.
///
/// Duplicate keys inside `fresh` collapse to one record: the last occurrence's value, kept
/// at the first occurrence's position so output order follows the sheet.
pub fn reconcile(fresh: Vec<MetricRecord>, existing: &HashSet<DedupKey>) -> Reconciliation {
    let mut positions: HashMap<DedupKey, usize> = HashMap::with_capacity(fresh.len());
    let mut unique: Vec<(DedupKey, MetricRecord)> = Vec::with_capacity(fresh.len());
    let mut superseded = 0;

    for record in fresh {
        let key = record.dedup_key();
        match positions.get(&key) {
            Some(&idx) => {
                unique[idx].1 = record;
                superseded += 1;
            }
            None => {
                positions.insert(key.clone(), unique.len());
                unique.push((key, record));
            }
        }
    }

    let (to_update, to_insert): (Vec<_>, Vec<_>) = unique
        .into_iter()
        .partition(|(key, _)| existing.contains(key));

    Reconciliation {
        to_insert: to_insert.into_iter().map(|(_, r)| r).collect(),
        to_update: to_update.into_iter().map(|(_, r)| r).collect(),
        superseded,
    }
}
