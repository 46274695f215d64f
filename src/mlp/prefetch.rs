//! Removal of misses a stride prefetcher would have covered.

use std::collections::VecDeque;

use super::placement::MissSlot;

#[derive(Debug, Clone, Copy)]
pub struct PrefetchParams {
    pub enabled: bool,
    /// PCs the prefetcher can track at once.
    pub flows: usize,
    pub rob_size: u64,
    pub dispatch_width: u64,
    pub dram_latency: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchOutcome {
    /// Remaining miss weight per trace position.
    pub misses: Vec<f64>,
    /// Misses removed, counting partially timely prefetches fractionally.
    pub prefetched: f64,
}

/// Positions that open a new reorder-buffer window: the first miss, then
/// every miss at least a ROB past the previous opening.
fn rob_starts(slots: &[MissSlot], rob: usize) -> Vec<usize> {
    let mut starts: Vec<usize> = Vec::new();
    for (i, s) in slots.iter().enumerate() {
        if s.value <= 0.0 {
            continue;
        }
        match starts.last() {
            Some(&last) if i < last + rob => {}
            _ => starts.push(i),
        }
    }
    starts
}

/// Walks the trace in order, tracking up to `flows` PCs. A prefetchable
/// miss of an already tracked PC is a prefetch candidate; it is removed
/// entirely when the previous reference of its PC is far enough back, and
/// partially when the prefetch would only have been issued inside the
/// current ROB window.
pub fn remove_prefetchable(load_pcs: &[u64], slots: &[MissSlot], params: &PrefetchParams) -> PrefetchOutcome {
    let mut misses = vec![0.0; slots.len()];
    let mut flows: VecDeque<u64> = VecDeque::with_capacity(params.flows);
    let mut candidates = Vec::new();

    for (i, (&pc, slot)) in load_pcs.iter().zip(slots).enumerate() {
        if slot.value <= 0.0 {
            continue;
        }
        let tracked = flows.contains(&pc);
        if params.enabled && slot.prefetchable && tracked {
            candidates.push(i);
        } else {
            misses[i] = slot.value;
        }
        if pc != 0 && !tracked && params.flows > 0 {
            if flows.len() == params.flows {
                flows.pop_front();
            }
            flows.push_back(pc);
        }
    }

    let mut prefetched = 0.0;
    if candidates.is_empty() {
        return PrefetchOutcome { misses, prefetched };
    }
    let rob = params.rob_size as usize;
    let starts = rob_starts(slots, rob);
    let rob_of = |at: usize| starts.partition_point(|&s| s <= at);

    for &at in &candidates {
        let pc = load_pcs[at];
        let earlier = (0..at).rev().filter(|&j| load_pcs[j] == pc);
        let prev = earlier
            .clone()
            .find(|&j| slots[j].prefetchable)
            .or_else(|| earlier.last());
        let Some(prev) = prev else {
            prefetched += 1.0;
            continue;
        };
        let window = rob_of(at);
        if window != rob_of(prev) || prev + rob <= at {
            prefetched += 1.0;
            continue;
        }
        let head = starts[window - 1];
        let issued = (at - head) as f64 / params.dispatch_width as f64;
        let fraction = (issued / params.dram_latency).min(1.0);
        misses[at] = 1.0 - fraction;
        prefetched += fraction;
    }
    PrefetchOutcome { misses, prefetched }
}
