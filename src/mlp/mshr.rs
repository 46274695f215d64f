//! Scaling of MLP when hits and misses together contend for more MSHRs than
//! the core has.

use crate::config::Machine;

#[derive(Debug, Clone)]
pub struct MshrParams {
    pub entries: u64,
    pub rob_size: u64,
    pub dispatch_width: u64,
    /// Miss cost of every data level, smallest first. The last entry is the
    /// cost of an LLC miss.
    pub miss_costs: Vec<f64>,
}

impl MshrParams {
    pub fn new(machine: &Machine) -> Self {
        MshrParams {
            entries: machine.mshr_entries,
            rob_size: machine.rob_size,
            dispatch_width: machine.dispatch_width,
            miss_costs: machine.levels.iter().map(|l| l.miss_cost).collect(),
        }
    }

    fn llc_miss_cost(&self) -> f64 {
        self.miss_costs.last().copied().unwrap_or(0.0)
    }

    /// Factor in `[0, 1]` by which `mlp` shrinks when the cache hits of
    /// `loads` loads (per level, from `exclusive` miss ratios, LLC last)
    /// occupy MSHRs alongside the DRAM misses.
    pub fn scaling_factor(&self, loads: f64, exclusive: &[f64], mlp: f64) -> f64 {
        if mlp == 0.0 {
            return 1.0;
        }
        let upper = exclusive.len().saturating_sub(1);
        let mut hits = 0.0;
        let mut cost = 0.0;
        for (i, &ex) in exclusive[..upper].iter().enumerate() {
            let level_hits = ex * loads;
            hits += level_hits;
            cost += level_hits * self.miss_costs.get(i).copied().unwrap_or(0.0);
        }
        let entries = self.entries as f64;
        if hits + mlp <= entries {
            return 1.0;
        }
        let hit_cost = if hits > 0.0 { cost / hits } else { 0.0 };

        let (hits_fract, mlp_fract) = (hits.fract(), mlp.fract());
        let combinations = [
            (hits.floor(), mlp.floor(), (1.0 - hits_fract) * (1.0 - mlp_fract)),
            (hits.floor(), mlp.ceil(), (1.0 - hits_fract) * mlp_fract),
            (hits.ceil(), mlp.floor(), hits_fract * (1.0 - mlp_fract)),
            (hits.ceil(), mlp.ceil(), hits_fract * mlp_fract),
        ];
        let factor: f64 = combinations
            .into_iter()
            .filter(|&(_, _, weight)| weight > 0.0)
            .map(|(h, m, weight)| {
                if h + m > entries {
                    weight * self.contended(h, m, hit_cost)
                } else {
                    weight
                }
            })
            .sum();
        factor.clamp(0.0, 1.0)
    }

    /// Expected share of `misses` DRAM misses that still overlap when
    /// `hits` cache hits compete for the MSHRs, for whole numbers of both.
    fn contended(&self, hits: f64, misses: f64, hit_cost: f64) -> f64 {
        if misses == 0.0 {
            return 0.0;
        }
        let entries = self.entries as f64;
        let llc_miss = self.llc_miss_cost();
        let events = hits + misses;
        let hits_fixed = (entries - misses).max(0.0);
        let misses_fixed = (entries - hits).max(0.0);
        let filled = hits_fixed + misses_fixed;
        let to_fill = (entries - filled).max(0.0) as u64;
        let remaining = events - filled;
        let p_hit = (hits - hits_fixed) / remaining;
        let p_miss = 1.0 - p_hit;
        let issue = entries / events * self.rob_size as f64 / self.dispatch_width as f64;

        let n = to_fill as f64;
        let mut binomial = 1.0;
        let mut mlp = 0.0;
        for i in 0..=to_fill {
            let i = i as f64;
            let chance = binomial * p_hit.powf(i) * p_miss.powf(n - i);
            let occupied = ((hits_fixed + i) * hit_cost + (misses_fixed + n - i) * llc_miss) / entries;
            let stall = (occupied - issue).max(0.0);
            let dram = entries - (hits_fixed + i);
            mlp += chance * (dram + (misses - dram) * (llc_miss - stall) / llc_miss);
            binomial = binomial * (n - i) / (i + 1.0);
        }
        (mlp / misses).max(0.0)
    }
}
