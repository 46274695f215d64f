//! Memory-level parallelism of DRAM misses, per window.
//!
//! The stride model places a micro-trace's loads and their expected LLC
//! misses, removes what a stride prefetcher would cover and measures the
//! overlap of what is left. The cold model works from the profiled
//! distribution of cold misses per reorder window instead; `cold_stride`
//! combines both.

pub mod cold;
pub mod mshr;
pub mod placement;
pub mod prefetch;
pub mod queue;
pub mod stride;
pub mod window;

use std::{collections::BTreeMap, fmt, str::FromStr};

use fastrand::Rng;
use serde::Serialize;

use crate::{
    config::Machine, diag::Diagnostics, records::MlpWindow, statstack::miss_ratio::MissRatio,
};

use self::{
    cold::{ColdEstimate, ColdInput},
    mshr::MshrParams,
    placement::{place_loads, place_misses},
    prefetch::{remove_prefetchable, PrefetchParams},
    queue::{QueueModel, QueueParams},
    stride::StrideParams,
    window::{window_mlp, LoadDependence},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MlpKind {
    Stride,
    Cold,
    ColdStride,
}

impl FromStr for MlpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stride" => Ok(MlpKind::Stride),
            "cold" => Ok(MlpKind::Cold),
            "cold_stride" => Ok(MlpKind::ColdStride),
            _ => Err(format!(
                "unknown MLP model `{s}` (expected stride, cold or cold_stride)"
            )),
        }
    }
}

impl fmt::Display for MlpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MlpKind::Stride => "stride",
            MlpKind::Cold => "cold",
            MlpKind::ColdStride => "cold_stride",
        })
    }
}

/// Weight of the latest window in the running MLP and prefetch averages.
const ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct MlpParams {
    pub kind: MlpKind,
    pub rob_size: u64,
    pub stride: StrideParams,
    pub prefetch: PrefetchParams,
    pub mshr: MshrParams,
    pub queue: QueueParams,
}

impl MlpParams {
    pub fn new(machine: &Machine, kind: MlpKind, queue: QueueModel, prefetch: bool) -> Self {
        MlpParams {
            kind,
            rob_size: machine.rob_size,
            stride: StrideParams {
                line_size: machine.line_size,
                page_half: machine.page_half,
                prefetch_in_page: machine.prefetch_in_page,
            },
            prefetch: PrefetchParams {
                enabled: prefetch,
                flows: machine.prefetcher_flows,
                rob_size: machine.rob_size,
                dispatch_width: machine.dispatch_width,
                dram_latency: machine.dram_latency_with_tag,
            },
            mshr: MshrParams::new(machine),
            queue: QueueParams {
                model: queue,
                bus_transfer_cycles: machine.bus_transfer_cycles,
                rob_size: machine.rob_size,
                dispatch_width: machine.dispatch_width,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Estimate {
    pub mlp: f64,
    pub queue_delay: f64,
    /// Misses removed by prefetching, in micro-trace units.
    pub prefetched: f64,
}

/// Placement statistics accumulated over every window of a benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MlpTotals {
    pub strided_pcs: u64,
    pub single_reference_pcs: u64,
    pub irregular_pcs: u64,
    pub randomly_placed_misses: f64,
    pub statstack_misses: u64,
}

/// Everything the estimator needs to know about one window.
#[derive(Debug, Clone, Copy)]
pub struct WindowInput<'a> {
    pub index: usize,
    pub window_instrs: u64,
    /// Interpolated data loads of the window.
    pub loads: f64,
    /// Interpolated load miss ratio of every data level, LLC last.
    pub load_ratios: &'a [f64],
    /// Micro-trace recorded inside the window.
    pub trace: &'a MlpWindow,
    /// Exclusive miss ratios of the trace's loads per level, LLC last.
    pub trace_exclusive: &'a [f64],
    /// Per-PC LLC miss ratios of the trace's loads.
    pub llc_pc_ratios: &'a BTreeMap<u64, MissRatio>,
    pub cold: &'a [(u64, u64)],
}

pub struct MlpEstimator {
    params: MlpParams,
    rng: Rng,
    avg_mlp: f64,
    avg_prefetched: f64,
    totals: MlpTotals,
    diag: Diagnostics,
}

impl MlpEstimator {
    pub fn new(params: MlpParams, diag: Diagnostics) -> Self {
        MlpEstimator {
            params,
            rng: Rng::with_seed(0),
            avg_mlp: 1.0,
            avg_prefetched: 0.0,
            totals: MlpTotals::default(),
            diag,
        }
    }

    pub fn params(&self) -> &MlpParams {
        &self.params
    }

    pub fn totals(&self) -> &MlpTotals {
        &self.totals
    }

    pub fn estimate(&mut self, input: &WindowInput<'_>) -> Estimate {
        match self.params.kind {
            MlpKind::Stride => self.stride(input),
            MlpKind::Cold => {
                let c = self.cold(input, None);
                Estimate {
                    mlp: c.mlp,
                    queue_delay: c.queue_delay,
                    prefetched: 0.0,
                }
            }
            MlpKind::ColdStride => {
                let s = self.stride(input);
                let c = self.cold(input, Some(s.mlp));
                Estimate {
                    mlp: c.mlp,
                    queue_delay: c.queue_delay,
                    prefetched: (s.prefetched * c.multiplier).floor(),
                }
            }
        }
    }

    fn cold(&self, input: &WindowInput<'_>, stride_mlp: Option<f64>) -> ColdEstimate {
        let dependence = LoadDependence::for_rob(&input.trace.chain_stats, self.params.rob_size);
        cold::estimate(
            &self.params,
            &dependence,
            &ColdInput {
                window_instrs: input.window_instrs,
                loads: input.loads,
                load_ratios: input.load_ratios,
                cold: input.cold,
            },
            stride_mlp,
        )
    }

    fn stride(&mut self, input: &WindowInput<'_>) -> Estimate {
        let w = input.index;
        let trace = input.trace;
        let llc_exclusive = input.trace_exclusive.last().copied().unwrap_or(0.0);
        if trace.counters.loads == 0 || llc_exclusive == 0.0 {
            self.diag.info(format_args!(
                "window {w}: no LLC load misses in the trace, using the running average"
            ));
            let estimate = Estimate {
                mlp: self.avg_mlp,
                queue_delay: self.params.queue.delay(self.avg_mlp),
                prefetched: self.avg_prefetched,
            };
            self.update_averages(1.0, 0.0);
            return estimate;
        }

        let len = trace.counters.micro_ops as usize;
        let loads = place_loads(len, &trace.pcs, &mut self.rng, &self.diag, w);
        let misses = place_misses(
            &loads,
            &trace.pcs,
            input.llc_pc_ratios,
            &self.params.stride,
            &mut self.rng,
            &self.diag,
            w,
        );
        let placed = misses.placed();
        if placed.round() != misses.expected as f64 {
            self.diag.error(format_args!(
                "window {w}: placed {placed} misses, statstack expects {}",
                misses.expected
            ));
        }
        self.totals.strided_pcs += misses.classes.strided;
        self.totals.single_reference_pcs += misses.classes.single;
        self.totals.irregular_pcs += misses.classes.irregular;
        self.totals.randomly_placed_misses += misses.randomly_placed;
        self.totals.statstack_misses += misses.expected;

        let remaining = remove_prefetchable(&loads.pcs, &misses.slots, &self.params.prefetch);
        let mlp = if placed > 0.0 {
            let dependence = LoadDependence::for_rob(&trace.chain_stats, self.params.rob_size);
            let raw = window_mlp(
                &loads.loads,
                &remaining.misses,
                &dependence,
                self.params.rob_size as usize,
                &self.diag,
                w,
            );
            raw * self.params.mshr.scaling_factor(loads.load_count() as f64, input.trace_exclusive, raw)
        } else {
            1.0
        };
        self.diag.info(format_args!(
            "window {w}: MLP {mlp}, {} misses prefetched",
            remaining.prefetched
        ));
        self.update_averages(mlp, remaining.prefetched);
        Estimate {
            mlp,
            queue_delay: self.params.queue.delay(mlp),
            prefetched: remaining.prefetched,
        }
    }

    fn update_averages(&mut self, mlp: f64, prefetched: f64) {
        self.avg_mlp = ALPHA * mlp + (1.0 - ALPHA) * self.avg_mlp;
        self.avg_prefetched = ALPHA * prefetched + (1.0 - ALPHA) * self.avg_prefetched;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::DataLevel,
        records::{ChainStats, PcProfile, TraceCounters},
    };

    pub(crate) fn machine() -> Machine {
        let level = |name: &str, size: u64, access_cost: f64, miss_cost: f64| DataLevel {
            name: name.to_string(),
            size,
            access_cost,
            miss_cost,
        };
        Machine {
            rob_size: 128,
            dispatch_width: 4,
            mshr_entries: 10,
            line_size: 64,
            levels: vec![
                level("L1D", 32 * 1024, 4.0, 9.0),
                level("L2", 256 * 1024, 9.0, 33.0),
                level("L3", 8192 * 1024, 33.0, 166.0),
            ],
            instruction_sizes: vec![32 * 1024, 8192 * 1024],
            dram_latency_with_tag: 166.0,
            bus_transfer_cycles: 8.0,
            page_half: 2048,
            prefetch_in_page: false,
            prefetcher_flows: 16,
        }
    }

    fn estimator(kind: MlpKind, prefetch: bool) -> MlpEstimator {
        MlpEstimator::new(
            MlpParams::new(&machine(), kind, QueueModel::Mlp, prefetch),
            Diagnostics::disabled("test", "mlp"),
        )
    }

    /// Four PCs, each loading once into a single ROB and always missing.
    fn scattered() -> MlpWindow {
        MlpWindow {
            counters: TraceCounters {
                instructions: 100,
                micro_ops: 100,
                loads: 4,
                stores: 0,
            },
            chain_stats: vec![ChainStats {
                rob_size: 128,
                frequency: vec![1],
            }],
            pcs: (0..4)
                .map(|i| PcProfile {
                    pc: 0x400 + i,
                    first_reference: i * 10,
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn always_miss(trace: &MlpWindow) -> BTreeMap<u64, MissRatio> {
        trace
            .pcs
            .iter()
            .map(|p| (p.pc, MissRatio { ratio: 1.0, refs: 1 }))
            .collect()
    }

    fn input<'a>(
        trace: &'a MlpWindow,
        ratios: &'a BTreeMap<u64, MissRatio>,
        exclusive: &'a [f64],
    ) -> WindowInput<'a> {
        WindowInput {
            index: 0,
            window_instrs: 1000,
            loads: 40.0,
            load_ratios: &[0.1, 0.1, 0.1],
            trace,
            trace_exclusive: exclusive,
            llc_pc_ratios: ratios,
            cold: &[],
        }
    }

    #[test]
    fn independent_misses_in_one_rob() {
        let trace = scattered();
        let ratios = always_miss(&trace);
        let mut est = estimator(MlpKind::Stride, true);
        let got = est.estimate(&input(&trace, &ratios, &[0.0, 0.0, 1.0]));
        assert_eq!(got.mlp, 4.0);
        assert_eq!(got.prefetched, 0.0);
        assert_eq!(got.queue_delay, est.params().queue.delay(4.0));
        assert_eq!(
            *est.totals(),
            MlpTotals {
                single_reference_pcs: 4,
                statstack_misses: 4,
                ..Default::default()
            }
        );
    }

    #[test]
    fn falls_back_to_running_average() {
        let trace = scattered();
        let ratios = always_miss(&trace);
        let mut est = estimator(MlpKind::Stride, true);
        est.estimate(&input(&trace, &ratios, &[0.0, 0.0, 1.0]));

        // 0.3 * 4 + 0.7 * 1
        let got = est.estimate(&input(&trace, &ratios, &[0.0, 0.0, 0.0]));
        assert!((got.mlp - 1.9).abs() < 1e-12);
        assert_eq!(got.prefetched, 0.0);
        let got = est.estimate(&input(&trace, &ratios, &[]));
        assert!((got.mlp - (0.3 + 0.7 * 1.9)).abs() < 1e-12);
    }

    #[test]
    fn runs_are_reproducible() {
        let mut trace = scattered();
        trace.pcs.push(PcProfile {
            pc: 0x800,
            first_reference: 1,
            reuse: vec![(3, 20), (5, 4)],
            first_address: 0x10000,
            strides: vec![(8, 20), (64, 4)],
        });
        trace.counters.loads += 25;
        let mut ratios = always_miss(&trace);
        ratios.insert(0x800, MissRatio { ratio: 0.2, refs: 25 });
        let run = || {
            let mut est = estimator(MlpKind::ColdStride, true);
            let first = est.estimate(&input(&trace, &ratios, &[0.1, 0.1, 0.3]));
            let second = est.estimate(&input(&trace, &ratios, &[0.1, 0.1, 0.3]));
            (first, second, *est.totals())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn model_names() {
        for kind in [MlpKind::Stride, MlpKind::Cold, MlpKind::ColdStride] {
            assert_eq!(kind.to_string().parse::<MlpKind>(), Ok(kind));
        }
        assert!("random".parse::<MlpKind>().is_err());
    }
}
