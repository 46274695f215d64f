//! Miss ratios from stack-distance histograms, and their interpolation over
//! instruction windows that do not line up with burst boundaries.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::records::Burst;

use super::hist::{Histogram, PcHistograms};

/// Miss ratio of one histogram at one cache size, with the number of
/// references it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MissRatio {
    pub ratio: f64,
    pub refs: u64,
}

/// Miss ratio as a step function of the cache size in lines.
#[derive(Debug, Clone, PartialEq)]
pub struct MissRatioCurve {
    /// `(stack distance, fraction of references at or beyond it)`
    steps: Vec<(u64, f64)>,
    refs: u64,
}

impl MissRatioCurve {
    /// `None` for a histogram without references.
    pub fn new(hist: &Histogram) -> Option<Self> {
        let refs = hist.total();
        if refs == 0 {
            return None;
        }
        let mut beyond = refs;
        let mut steps = Vec::new();
        for (sdist, count) in hist.iter() {
            steps.push((sdist, beyond as f64 / refs as f64));
            beyond -= count;
        }
        Some(MissRatioCurve { steps, refs })
    }

    pub fn refs(&self) -> u64 {
        self.refs
    }

    /// Fraction of references with a stack distance of at least `lines`.
    pub fn at(&self, lines: u64) -> f64 {
        let i = self.steps.partition_point(|&(sdist, _)| sdist < lines);
        self.steps.get(i).map_or(0.0, |&(_, ratio)| ratio)
    }

    /// The curve sampled at each of `sizes` (in lines).
    pub fn sample(&self, sizes: &[u64]) -> Vec<(u64, f64)> {
        sizes.iter().map(|&s| (s, self.at(s))).collect()
    }
}

/// Miss ratio of `hist` in a cache of `size` bytes.
pub fn miss_ratio(hist: &Histogram, size: u64, line_size: u64) -> MissRatio {
    match MissRatioCurve::new(hist) {
        Some(curve) => MissRatio {
            ratio: curve.at(size / line_size),
            refs: curve.refs(),
        },
        None => MissRatio::default(),
    }
}

/// Miss ratios of every histogram for every cache size, indexed
/// `[size][burst]`.
pub fn burst_miss_ratios(hists: &[&Histogram], sizes: &[u64], line_size: u64) -> Vec<Vec<MissRatio>> {
    sizes
        .iter()
        .map(|&size| {
            hists
                .iter()
                .map(|h| miss_ratio(h, size, line_size))
                .collect()
        })
        .collect()
}

/// Per-PC miss ratios of one burst for every cache size.
pub fn pc_miss_ratios(
    per_pc: &PcHistograms,
    sizes: &[u64],
    line_size: u64,
) -> Vec<BTreeMap<u64, MissRatio>> {
    sizes
        .iter()
        .map(|&size| {
            per_pc
                .iter()
                .map(|(&pc, h)| (pc, miss_ratio(h, size, line_size)))
                .collect()
        })
        .collect()
}

/// Fraction of loads that miss in each level but hit in the next one; the
/// last level keeps its full miss ratio. Also returns the loads seen per
/// level.
pub fn exclusive_miss_ratios(pc_ratios: &[BTreeMap<u64, MissRatio>]) -> (Vec<f64>, Vec<f64>) {
    let mut misses = Vec::with_capacity(pc_ratios.len());
    let mut loads = Vec::with_capacity(pc_ratios.len());
    for level in pc_ratios {
        let (m, l) = level.values().fold((0.0, 0.0), |(m, l), r| {
            (m + r.ratio * r.refs as f64, l + r.refs as f64)
        });
        misses.push(m);
        loads.push(l);
    }
    let mut exclusive = misses.clone();
    for i in 1..misses.len() {
        exclusive[i - 1] -= misses[i];
    }
    for (ex, &l) in exclusive.iter_mut().zip(&loads) {
        *ex = if l > 0.0 { *ex / l } else { 0.0 };
    }
    (exclusive, loads)
}

/// Misses and accesses integrated over a window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Interpolated {
    pub misses: f64,
    pub accesses: f64,
}

impl Interpolated {
    /// Zero when the window saw no accesses.
    pub fn ratio(&self) -> f64 {
        if self.accesses == 0.0 {
            0.0
        } else {
            self.misses / self.accesses
        }
    }

    pub fn hits(&self) -> f64 {
        self.accesses - self.misses
    }
}

/// Per-instruction miss and access rates of one burst.
fn rates(burst: &Burst, ratio: Option<&MissRatio>, sample_rate: f64) -> (f64, f64) {
    let instrs = burst.instructions();
    match ratio {
        Some(r) if instrs > 0 => {
            let api = r.refs as f64 * sample_rate / instrs as f64;
            (r.ratio * api, api)
        }
        _ => (0.0, 0.0),
    }
}

/// Integrates the miss and access rates of `current` (the bursts covering
/// `window`, with `ratios` in the same order) over the window's instructions.
///
/// Inside a burst the rates are constant. Between two bursts that do not
/// touch, they change linearly from one burst's rate to the next.
pub fn interpolate(
    window: (u64, u64),
    bursts: &[Burst],
    current: &[usize],
    ratios: &[MissRatio],
    sample_rate: f64,
) -> Interpolated {
    let (start, end) = (window.0 as f64, window.1 as f64);
    let mut low = start;
    let mut out = Interpolated::default();
    for (i, &b) in current.iter().enumerate() {
        let Some(burst) = bursts.get(b) else { break };
        let (mpi, api) = rates(burst, ratios.get(i), sample_rate);
        let Some(next) = current.get(i + 1).and_then(|&n| bursts.get(n)) else {
            let span = (end - low.max(burst.instr_begin as f64)).max(0.0);
            out.misses += mpi * span;
            out.accesses += api * span;
            break;
        };

        let burst_end = burst.instr_end as f64;
        let span = (burst_end - low).max(0.0);
        out.misses += mpi * span;
        out.accesses += api * span;

        let x1 = burst_end.max(low);
        let x2 = (next.instr_begin as f64).min(end);
        let gap = next.instr_begin as f64 - burst_end;
        if gap > 0.0 && x2 > x1 {
            let (mpi_next, api_next) = rates(next, ratios.get(i + 1), sample_rate);
            let ramp = |from: f64, to: f64| {
                from * (x2 - x1)
                    + (to - from) / gap * ((x2 * x2 - x1 * x1) / 2.0 - burst_end * (x2 - x1))
            };
            out.misses += ramp(mpi, mpi_next);
            out.accesses += ramp(api, api_next);
        }
        low += span + (x2 - x1).max(0.0);
        if low >= end {
            break;
        }
    }
    out
}
