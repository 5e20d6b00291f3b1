use super::{Event, EventKind};

/// Events that belong to the Tractor execution `tractor`.
///
/// An inner event shares the transaction of `tractor`, comes after it, and
/// comes before the next Tractor event of that transaction.
pub fn inner_events<'e>(tractor: &Event, events: &'e [Event]) -> Vec<&'e Event> {
    let tx = tractor.raw_log.transaction_hash;
    let start = tractor.raw_log.log_index;
    let end = events
        .iter()
        .filter(|evt| {
            evt.kind() == EventKind::Tractor
                && evt.raw_log.transaction_hash == tx
                && evt.raw_log.log_index > start
        })
        .map(|evt| evt.raw_log.log_index)
        .min()
        .unwrap_or(u64::MAX);

    events
        .iter()
        .filter(|evt| {
            evt.kind() != EventKind::Tractor
                && evt.raw_log.transaction_hash == tx
                && evt.raw_log.log_index > start
                && evt.raw_log.log_index < end
        })
        .collect()
}
