//! MLP from the profiled distribution of cold misses per reorder window.

use super::{window::LoadDependence, MlpParams};

#[derive(Debug, Clone, Copy)]
pub struct ColdInput<'a> {
    pub window_instrs: u64,
    /// Data loads of the window.
    pub loads: f64,
    /// Interpolated load miss ratio of every data level, LLC last.
    pub load_ratios: &'a [f64],
    /// `(cold misses in a ROB, occurrences)`
    pub cold: &'a [(u64, u64)],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColdEstimate {
    pub mlp: f64,
    pub queue_delay: f64,
    /// Scale from the trace's prefetch count to the window's non-cold misses.
    pub multiplier: f64,
}

/// Blends the MLP of cold misses with that of the remaining (conflict and
/// capacity) misses. Without `stride_mlp` the remaining misses are assumed
/// spread evenly over the window's ROBs; with it, that estimate is used for
/// them instead.
pub fn estimate(
    params: &MlpParams,
    dependence: &LoadDependence,
    input: &ColdInput<'_>,
    stride_mlp: Option<f64>,
) -> ColdEstimate {
    let chance = input.load_ratios.last().copied().unwrap_or(0.0);
    let loads = input.loads;
    if loads == 0.0 || chance == 0.0 {
        return ColdEstimate {
            mlp: 1.0,
            queue_delay: params.queue.bus_transfer_cycles,
            multiplier: 1.0,
        };
    }

    let total_robs = input.window_instrs as f64 / params.rob_size as f64;
    let (cold, cold_robs) = input
        .cold
        .iter()
        .fold((0.0, 0.0), |(m, r), &(misses, times)| {
            (m + (misses * times) as f64, r + times as f64)
        });
    let conflict = ((loads * chance - cold) / loads).max(0.0);
    let per_rob = if total_robs > 0.0 { loads / total_robs } else { loads };

    let conflict_mlp = dependence.overlap(chance, conflict * per_rob).max(1.0);
    let mut cold_mlp = 1.0;
    if cold_robs > 0.0 {
        cold_mlp += dependence.overlap(chance, cold / cold_robs);
    }

    let mut exclusive = input.load_ratios.to_vec();
    for i in 1..exclusive.len() {
        exclusive[i - 1] -= input.load_ratios[i];
    }
    let denom = cold.max(loads * chance);
    let conflict_share = loads * conflict / denom;

    match stride_mlp {
        None => {
            let mut mlp = cold / denom * cold_mlp + conflict_share * conflict_mlp;
            mlp *= params.mshr.scaling_factor(loads, &exclusive, mlp);
            ColdEstimate {
                mlp,
                queue_delay: params.queue.delay(mlp),
                multiplier: 1.0,
            }
        }
        Some(stride_mlp) => {
            cold_mlp *= params.mshr.scaling_factor(loads, &exclusive, cold_mlp);
            let mlp = cold / denom * cold_mlp + conflict_share * stride_mlp;
            let non_cold = loads * conflict;
            ColdEstimate {
                mlp,
                queue_delay: params.queue.delay(mlp),
                multiplier: if non_cold > 0.0 { denom / non_cold } else { 1.0 },
            }
        }
    }
}
