//! Memory model of one benchmark, window after window.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use serde::Serialize;

use crate::{
    config::Machine,
    diag::Diagnostics,
    error::ModelError,
    metadata::ProfileMetadata,
    mlp::{queue::QueueModel, Estimate, MlpEstimator, MlpKind, MlpParams, MlpTotals, WindowInput},
    records::{AccessKind, ColdWindow, MlpWindow},
    statstack::{
        hist::{Histogram, PcHistograms},
        miss_ratio::{
            burst_miss_ratios, exclusive_miss_ratios, interpolate, pc_miss_ratios, Interpolated,
        },
        Source, Statstack,
    },
    trace::{numbered_files, Record, RecordReader},
};

/// Options shared by every benchmark of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub mlp: MlpKind,
    pub queue: QueueModel,
    pub prefetch: bool,
    pub boundary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub start: u64,
    pub end: u64,
    /// Interpolated load misses and accesses per data level.
    pub loads: Vec<Interpolated>,
    pub stores: Vec<Interpolated>,
    /// Per instruction cache; empty without instruction samples.
    pub instructions: Vec<Interpolated>,
    pub l1d_load_hits: f64,
    pub l1d_store_hits: f64,
    /// LLC load misses left after prefetching.
    pub llc_load_misses: f64,
    pub trace_misses: f64,
    pub mlp: f64,
    pub queue_delay: f64,
    pub prefetched: f64,
    pub dram_cycles: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkTotals {
    pub instructions: u64,
    pub llc_load_misses: f64,
    pub prefetched: f64,
    pub dram_cycles: f64,
    pub placement: MlpTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub benchmark: String,
    pub mlp_model: MlpKind,
    pub windows: Vec<WindowReport>,
    pub totals: BenchmarkTotals,
}

/// Interpolated misses over `window` of every cache size in `sizes`.
fn interpolate_levels(
    ss: &mut Statstack,
    window: (u64, u64),
    bursts: &[usize],
    sizes: &[u64],
    line_size: u64,
    sample_rate: f64,
) -> Result<Vec<Interpolated>, ModelError> {
    let empty = Histogram::new();
    let ratios = {
        let sd = ss.sd_hists(bursts)?;
        let hists: Vec<&Histogram> = bursts
            .iter()
            .map(|b| sd.get(b).map_or(&empty, |s| &s.hist))
            .collect();
        burst_miss_ratios(&hists, sizes, line_size)
    };
    Ok(ratios
        .iter()
        .map(|r| interpolate(window, ss.bursts(), bursts, r, sample_rate))
        .collect())
}

fn next_window<R: Record>(
    reader: &mut RecordReader<R>,
    what: &str,
    index: usize,
) -> Result<R, ModelError> {
    reader
        .read_record()?
        .ok_or_else(|| ModelError::MissingInput(format!("{what} record for window {index}")))
}

/// Runs the memory model over every window of `benchmark` and writes
/// `<output>/<benchmark>/memory.json`. Checks `cancel` between windows.
pub fn run_benchmark(
    machine: &Machine,
    options: &RunOptions,
    benchmark: &str,
    cancel: &AtomicBool,
) -> Result<BenchmarkReport, ModelError> {
    let root = options.input.join(benchmark);
    let meta = ProfileMetadata::read(&root.join("log.out"))?;
    let compressed = meta.compressed;
    let ss_diag = Diagnostics::new(&options.output, benchmark, "statstack")?;
    let mlp_diag = Diagnostics::new(&options.output, benchmark, "mlp")?;
    tracing::info!(benchmark, windows = meta.windows.len(), "starting memory model");

    let open = |source, kind| {
        Statstack::open(
            &options.input,
            benchmark,
            source,
            kind,
            compressed,
            options.boundary,
            ss_diag.clone(),
        )
    };
    let mut loads = open(Source::Data, AccessKind::Load)?;
    let mut stores = open(Source::Data, AccessKind::Store)?;
    let mut trace = open(Source::Trace, AccessKind::Load)?;
    let mut instr = if Source::Instr.present(&root) {
        Some(open(Source::Instr, AccessKind::Load)?)
    } else {
        ss_diag.info("no instruction samples, skipping instruction caches");
        None
    };

    let load_bursts = loads.align_bursts(&meta.windows);
    let store_bursts = stores.align_bursts(&meta.windows);
    let instr_bursts = instr
        .as_mut()
        .map(|ss| ss.align_bursts(&meta.windows))
        .unwrap_or_default();

    let mut mlp_windows = RecordReader::<MlpWindow>::open(numbered_files(&root, "mlp")?, compressed)?;
    let mut cold_windows = match options.mlp {
        MlpKind::Stride => None,
        MlpKind::Cold | MlpKind::ColdStride => Some(RecordReader::<ColdWindow>::open(
            numbered_files(&root, "cold_misses")?,
            compressed,
        )?),
    };

    let mut estimator = MlpEstimator::new(
        MlpParams::new(machine, options.mlp, options.queue, options.prefetch),
        mlp_diag,
    );
    let sizes = machine.cache_sizes();
    let line = machine.line_size;
    let sample_rate = meta.sample_rate as f64;
    let no_pcs = PcHistograms::new();

    let mut windows = Vec::with_capacity(meta.windows.len());
    let mut totals = BenchmarkTotals::default();
    for (i, &window) in meta.windows.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return Err(ModelError::Cancelled);
        }
        let load_ratios = interpolate_levels(&mut loads, window, &load_bursts[i], &sizes, line, sample_rate)?;
        let store_ratios = interpolate_levels(&mut stores, window, &store_bursts[i], &sizes, line, sample_rate)?;
        let instr_ratios = match instr.as_mut() {
            Some(ss) => interpolate_levels(
                ss,
                window,
                &instr_bursts[i],
                &machine.instruction_sizes,
                line,
                sample_rate,
            )?,
            None => Vec::new(),
        };

        let pc_ratios = {
            let sd = trace.sd_hists(&[i])?;
            let per_pc = sd.get(&i).map_or(&no_pcs, |s| &s.per_pc);
            pc_miss_ratios(per_pc, &sizes, line)
        };
        let (exclusive, trace_loads) = exclusive_miss_ratios(&pc_ratios);
        let trace_misses = exclusive.last().copied().unwrap_or(0.0) * trace_loads.last().copied().unwrap_or(0.0);

        let mlp_window = next_window(&mut mlp_windows, "MLP", i)?;
        let cold = match cold_windows.as_mut() {
            Some(reader) => {
                let record = next_window(reader, "cold-miss", i)?;
                record
                    .distribution(machine.rob_size, line)
                    .map(<[_]>::to_vec)
                    .ok_or_else(|| {
                        ModelError::MissingInput(format!(
                            "cold-miss distribution for ROB {} and {line}-byte lines",
                            machine.rob_size
                        ))
                    })?
            }
            None => Vec::new(),
        };

        let window_instrs = window.1 - window.0;
        let trace_window = meta.trace_window.unwrap_or(window_instrs) as f64;
        let window_sample_rate = match mlp_window.counters.instructions {
            0 => 0.0,
            n => trace_window / n as f64,
        };
        let llc = load_ratios.last().copied().unwrap_or_default();
        let miss_ratios: Vec<f64> = load_ratios.iter().map(Interpolated::ratio).collect();
        let no_llc_ratios = Default::default();
        let estimate: Estimate = estimator.estimate(&WindowInput {
            index: i,
            window_instrs,
            loads: llc.accesses,
            load_ratios: &miss_ratios,
            trace: &mlp_window,
            trace_exclusive: &exclusive,
            llc_pc_ratios: pc_ratios.last().unwrap_or(&no_llc_ratios),
            cold: &cold,
        });

        let prefetched = estimate.prefetched * window_sample_rate;
        let llc_load_misses = llc.misses - llc.misses.min(prefetched);
        let dram_cycles =
            llc_load_misses / estimate.mlp * (machine.dram_latency_with_tag + estimate.queue_delay);

        totals.instructions += window_instrs;
        totals.llc_load_misses += llc_load_misses;
        totals.prefetched += prefetched;
        totals.dram_cycles += dram_cycles;
        windows.push(WindowReport {
            start: window.0,
            end: window.1,
            l1d_load_hits: load_ratios.first().map_or(0.0, Interpolated::hits),
            l1d_store_hits: store_ratios.first().map_or(0.0, Interpolated::hits),
            loads: load_ratios,
            stores: store_ratios,
            instructions: instr_ratios,
            llc_load_misses,
            trace_misses,
            mlp: estimate.mlp,
            queue_delay: estimate.queue_delay,
            prefetched,
            dram_cycles,
        });
    }

    loads.finish()?;
    stores.finish()?;
    trace.finish()?;
    if let Some(ss) = instr {
        ss.finish()?;
    }

    totals.placement = *estimator.totals();
    let report = BenchmarkReport {
        benchmark: benchmark.to_string(),
        mlp_model: options.mlp,
        windows,
        totals,
    };
    write_report(&options.output.join(benchmark), &report)?;
    tracing::info!(
        benchmark,
        dram_cycles = report.totals.dram_cycles,
        "memory model done"
    );
    Ok(report)
}

fn write_report(dir: &Path, report: &BenchmarkReport) -> Result<(), ModelError> {
    fs::create_dir_all(dir).map_err(|e| ModelError::io(dir, e))?;
    let path = dir.join("memory.json");
    let file = fs::File::create(&path).map_err(|e| ModelError::io(&path, e))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
