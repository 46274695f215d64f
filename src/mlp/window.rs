//! Memory-level parallelism of a trace window, one reorder buffer at a time.

use crate::{diag::Diagnostics, records::ChainStats};

/// Distribution of load dependence chain lengths for one ROB size:
/// `fractions[d - 1]` is the share of loads at the end of a chain of `d`
/// dependent loads.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadDependence {
    pub fractions: Vec<f64>,
}

impl LoadDependence {
    /// Picks the largest profiled ROB size not exceeding `rob_size`. Chain
    /// stats must be sorted by ROB size.
    pub fn for_rob(chains: &[ChainStats], rob_size: u64) -> Self {
        let Some(chain) = chains.iter().take_while(|c| c.rob_size <= rob_size).last() else {
            return LoadDependence::default();
        };
        let total: u64 = chain.frequency.iter().sum();
        let fractions = chain
            .frequency
            .iter()
            .map(|&f| if total == 0 { 0.0 } else { f as f64 / total as f64 })
            .collect();
        LoadDependence { fractions }
    }

    /// Misses expected to overlap when `misses` misses happen among loads
    /// that miss with probability `miss_ratio`: a load at depth `d` only
    /// overlaps when none of the `d - 1` loads before it missed.
    pub fn overlap(&self, miss_ratio: f64, misses: f64) -> f64 {
        self.fractions
            .iter()
            .enumerate()
            .map(|(d, f)| f * (1.0 - miss_ratio).powi(d as i32) * misses)
            .sum()
    }
}

/// Average MLP over the ROB windows of a trace that hold at least one miss.
pub fn window_mlp(
    loads: &[bool],
    misses: &[f64],
    dependence: &LoadDependence,
    rob_size: usize,
    diag: &Diagnostics,
    window: usize,
) -> f64 {
    let len = misses.len();
    let mut head = 0;
    let mut mlp = 0.0;
    let mut robs = 0u64;
    while head < len {
        let Some(next) = misses[head..].iter().position(|&m| m > 0.0) else {
            break;
        };
        head += next;
        let tail = (head + rob_size).min(len);
        let mut rob_loads = loads[head..tail.min(loads.len())].iter().filter(|&&l| l).count() as f64;
        let rob_misses: f64 = misses[head..tail].iter().sum();
        if rob_loads < rob_misses {
            diag.error(format_args!(
                "window {window}: {rob_misses} misses but only {rob_loads} loads in the ROB at {head}"
            ));
            rob_loads = rob_misses;
        }
        mlp += dependence.overlap(rob_misses / rob_loads, rob_misses);
        head += rob_size;
        robs += 1;
    }
    if robs == 0 {
        return 1.0;
    }
    (mlp / robs as f64).max(1.0)
}
