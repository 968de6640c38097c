//! Batch selection.
//!
//! A batch reserves `ceil(max_items * 0.3)` slots for urgent (Critical or
//! High) items. The remaining slots go to the oldest pending items of any
//! band, so low bands drain steadily while urgent changes never wait behind
//! a backlog. The selected items are returned in queue order (band, then
//! enqueue time) and capped by total payload size; the first item is always
//! included so an oversized change is sent on its own.

use crate::types::QueuedChange;

/// Fraction of batch slots reserved for urgent items, in tenths.
const URGENT_RESERVE_TENTHS: usize = 3;

pub fn reserved_slots(max_items: usize) -> usize {
    (max_items * URGENT_RESERVE_TENTHS).div_ceil(10)
}

/// Picks the next batch from `pending`, which must be in queue order.
pub fn select_batch(pending: &[QueuedChange], max_items: usize, max_bytes: usize) -> Vec<QueuedChange> {
    if max_items == 0 || pending.is_empty() {
        return Vec::new();
    }

    let mut chosen = vec![false; pending.len()];
    let mut taken = 0;

    for (i, _) in pending
        .iter()
        .enumerate()
        .filter(|(_, c)| c.priority.is_urgent())
        .take(reserved_slots(max_items))
    {
        chosen[i] = true;
        taken += 1;
    }

    let mut by_age: Vec<usize> = (0..pending.len()).collect();
    by_age.sort_by(|&a, &b| age_key(&pending[a]).cmp(age_key(&pending[b])));
    for i in by_age {
        if taken >= max_items {
            break;
        }
        if !chosen[i] {
            chosen[i] = true;
            taken += 1;
        }
    }

    let mut batch = Vec::with_capacity(taken);
    let mut total_bytes = 0usize;
    for (change, _) in pending.iter().zip(&chosen).filter(|(_, c)| **c) {
        let size = change.payload_size();
        if !batch.is_empty() && total_bytes + size > max_bytes {
            break;
        }
        total_bytes += size;
        batch.push(change.clone());
    }
    batch
}

/// Enqueue time and sequence, without the band prefix.
fn age_key(change: &QueuedChange) -> &str {
    change
        .sort_key
        .split_once('-')
        .map(|(_, rest)| rest)
        .unwrap_or(&change.sort_key)
}
