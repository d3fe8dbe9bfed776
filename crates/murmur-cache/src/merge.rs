//! Merging authoritative rows with local-only records.

use std::cmp::Ordering;
use std::collections::HashSet;

use murmur_remote::SortOrder;
use uuid::Uuid;

use crate::Record;

/// Comparator for a collection's view order.
pub fn view_order(order: SortOrder) -> impl Fn(&Record, &Record) -> Ordering {
    move |a, b| match order {
        SortOrder::Ascending => Record::chronological(a, b),
        SortOrder::Descending => Record::chronological(b, a),
    }
}

/// Sort records into view order.
pub fn sort_records(records: &mut [Record], order: SortOrder) {
    records.sort_by(view_order(order));
}

/// Insert a record at its sorted position.
pub fn insert_sorted(records: &mut Vec<Record>, record: Record, order: SortOrder) -> usize {
    let cmp = view_order(order);
    let pos = records.partition_point(|r| cmp(r, &record) != Ordering::Greater);
    records.insert(pos, record);
    pos
}

/// Merge remote records with a local snapshot.
///
/// The result holds every remote record plus the snapshot's local-only
/// records whose id and idempotency key are both absent remotely. Remote
/// records win on collision. Confirmed records missing from `remote` were
/// deleted elsewhere and are dropped.
pub fn merge(remote: Vec<Record>, snapshot: &[Record], order: SortOrder) -> Vec<Record> {
    let mut ids: HashSet<String> = HashSet::with_capacity(remote.len());
    let mut client_keys: HashSet<Uuid> = HashSet::with_capacity(remote.len());
    let mut merged: Vec<Record> = Vec::with_capacity(remote.len() + snapshot.len());

    for record in remote {
        let duplicate_key = record.client_key.is_some_and(|k| client_keys.contains(&k));
        if ids.contains(&record.id) || duplicate_key {
            continue;
        }
        ids.insert(record.id.clone());
        if let Some(key) = record.client_key {
            client_keys.insert(key);
        }
        merged.push(record);
    }

    merged.extend(
        snapshot
            .iter()
            .filter(|r| r.is_local())
            .filter(|r| !ids.contains(&r.id))
            .filter(|r| !r.client_key.is_some_and(|k| client_keys.contains(&k)))
            .cloned(),
    );

    sort_records(&mut merged, order);
    merged
}

/// Whether records are in view order with unique ids.
pub fn is_well_formed(records: &[Record], order: SortOrder) -> bool {
    let cmp = view_order(order);
    let ordered = records
        .windows(2)
        .all(|w| cmp(&w[0], &w[1]) != Ordering::Greater);
    let mut seen = HashSet::with_capacity(records.len());
    ordered && records.iter().all(|r| seen.insert(r.id.as_str()))
}
