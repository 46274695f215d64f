//! StatStack: per-burst stack-distance histograms from sampled reuse pairs.

mod cache_file;
pub mod correlate;
pub mod hist;
pub mod lru;
pub mod miss_ratio;
pub mod vicinity;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{
    diag::Diagnostics,
    error::ModelError,
    records::{AccessKind, Burst, PcSdHistRecord, Sample, SdHistRecord},
    trace::{numbered_files, RecordReader},
};

use self::{
    cache_file::{CacheReader, CacheWriter},
    correlate::{Correlator, Resolution},
    vicinity::{transform, StackDistances, TakeoffHistograms},
};

/// Bumped whenever the derivation of cached histograms changes.
pub const CACHE_VERSION: &str = "1";

/// Which profiler stream a [`Statstack`] models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Sampled data accesses.
    Data,
    /// Sampled instruction fetches.
    Instr,
    /// Accesses of the micro-trace windows, resolved per PC.
    Trace,
}

impl Source {
    pub fn stem(self) -> &'static str {
        match self {
            Source::Data => "data",
            Source::Instr => "instr",
            Source::Trace => "trace",
        }
    }

    pub fn resolution(self) -> Resolution {
        match self {
            Source::Trace => Resolution::Pc,
            Source::Data | Source::Instr => Resolution::Burst,
        }
    }

    fn cache_name(self, kind: AccessKind, benchmark: &str) -> String {
        let what = match (self, kind) {
            (Source::Instr, _) => "instr",
            (Source::Trace, AccessKind::Load) => "load_PC",
            (Source::Trace, AccessKind::Store) => "store_PC",
            (Source::Data, AccessKind::Load) => "load",
            (Source::Data, AccessKind::Store) => "store",
        };
        format!("sd_{what}_{benchmark}.in")
    }

    /// Whether the benchmark directory holds samples for this source.
    pub fn present(self, benchmark_dir: &Path) -> bool {
        benchmark_dir
            .join(format!("burst_{}.0", self.stem()))
            .is_file()
    }
}

enum Cache {
    Bursts(CacheReader<SdHistRecord>),
    Pcs(CacheReader<PcSdHistRecord>),
}

enum Writer {
    Bursts(CacheWriter<SdHistRecord>),
    Pcs(CacheWriter<PcSdHistRecord>),
}

impl Writer {
    fn write(&mut self, burst: usize, sd: &StackDistances) -> Result<(), ModelError> {
        match self {
            Writer::Bursts(w) => w.write(burst, sd),
            Writer::Pcs(w) => w.write(burst, sd),
        }
    }

    fn finish(self) -> Result<(), ModelError> {
        match self {
            Writer::Bursts(w) => w.finish(),
            Writer::Pcs(w) => w.finish(),
        }
    }
}

enum Backend {
    Cached(Cache),
    Live {
        correlator: Correlator,
        takeoffs: TakeoffHistograms,
        writer: Writer,
    },
}

/// Stack-distance histograms of one access kind of one source, served
/// window after window.
pub struct Statstack {
    source: Source,
    kind: AccessKind,
    bursts: Vec<Burst>,
    boundary: bool,
    backend: Backend,
    prev: BTreeMap<usize, StackDistances>,
    align_from: usize,
    diag: Diagnostics,
}

impl Statstack {
    /// Opens the cached histograms under `<input>/sd_hists_<version>/` when
    /// they exist, otherwise prepares to correlate the sample files in
    /// `<input>/<benchmark>/`.
    pub fn open(
        input: &Path,
        benchmark: &str,
        source: Source,
        kind: AccessKind,
        compressed: bool,
        boundary: bool,
        diag: Diagnostics,
    ) -> Result<Self, ModelError> {
        let root = input.join(benchmark);
        let bursts = read_bursts(&root.join(format!("burst_{}.0", source.stem())))?;
        let cache_path = input
            .join(format!("sd_hists_{CACHE_VERSION}"))
            .join(source.cache_name(kind, benchmark));

        let backend = if cache_path.is_file() {
            diag.info(format_args!("reading stack distances from {}", cache_path.display()));
            Backend::Cached(match source.resolution() {
                Resolution::Burst => Cache::Bursts(CacheReader::open(&cache_path)?),
                Resolution::Pc => Cache::Pcs(CacheReader::open(&cache_path)?),
            })
        } else {
            let files = sample_files(&root, source.stem())?;
            diag.info(format_args!(
                "creating reuse distance histograms from {} files",
                files.len()
            ));
            let takeoffs =
                TakeoffHistograms::from_samples(RecordReader::<Sample>::open(files, compressed)?)?;
            let correlator =
                Correlator::open(&root, source.stem(), kind, source.resolution(), compressed)?;
            let writer = match source.resolution() {
                Resolution::Burst => Writer::Bursts(CacheWriter::create(&cache_path)?),
                Resolution::Pc => Writer::Pcs(CacheWriter::create(&cache_path)?),
            };
            Backend::Live {
                correlator,
                takeoffs,
                writer,
            }
        };

        Ok(Statstack {
            source,
            kind,
            bursts,
            boundary,
            backend,
            prev: BTreeMap::new(),
            align_from: 0,
            diag,
        })
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn kind(&self) -> AccessKind {
        self.kind
    }

    pub fn bursts(&self) -> &[Burst] {
        &self.bursts
    }

    /// Stack distances for `requested`. Bursts already served by the
    /// previous call are reused; every other burst is derived (or read from
    /// the cache) exactly once, so calls must come in increasing burst order.
    pub fn sd_hists(
        &mut self,
        requested: &[usize],
    ) -> Result<&BTreeMap<usize, StackDistances>, ModelError> {
        let mut fresh: Vec<usize> = requested
            .iter()
            .copied()
            .filter(|b| !self.prev.contains_key(b))
            .collect();
        fresh.sort_unstable();
        fresh.dedup();

        let mut out = BTreeMap::new();
        match &mut self.backend {
            Backend::Cached(cache) => {
                for &b in &fresh {
                    let sd = match cache {
                        Cache::Bursts(r) => r.next_burst(b)?,
                        Cache::Pcs(r) => r.next_burst(b)?,
                    };
                    out.insert(b, sd);
                }
            }
            Backend::Live {
                correlator,
                takeoffs,
                writer,
            } => {
                let landing = correlator.correlate(&self.bursts, &fresh, &self.diag)?;
                let no_pcs = Default::default();
                for (b, hist) in &landing.bursts {
                    let per_pc = landing.per_pc.get(b).unwrap_or(&no_pcs);
                    let sd = transform(
                        takeoffs,
                        &self.bursts,
                        *b,
                        hist,
                        per_pc,
                        self.boundary,
                        &self.diag,
                    );
                    writer.write(*b, &sd)?;
                    out.insert(*b, sd);
                }
            }
        }

        for b in requested {
            if let Some(sd) = self.prev.remove(b) {
                out.insert(*b, sd);
            }
        }
        self.prev = out;
        Ok(&self.prev)
    }

    /// For every window, the bursts from the last one starting at or before
    /// the window's start up to the first one ending after the window's end.
    /// Windows must be sorted.
    pub fn align_bursts(&mut self, windows: &[(u64, u64)]) -> Vec<Vec<usize>> {
        windows.iter().map(|&w| self.align(w)).collect()
    }

    fn align(&mut self, (start, end): (u64, u64)) -> Vec<usize> {
        if self.bursts.is_empty() {
            return Vec::new();
        }
        let rest = &self.bursts[self.align_from..];
        let low = self.align_from + rest.partition_point(|b| b.instr_begin <= start).saturating_sub(1);
        let high = self.bursts[low..]
            .iter()
            .position(|b| b.instr_end > end)
            .map_or(self.bursts.len() - 1, |i| low + i);
        self.align_from = low;
        (low..=high).collect()
    }

    /// Moves the histograms derived in this run into the cache.
    pub fn finish(self) -> Result<(), ModelError> {
        match self.backend {
            Backend::Live { writer, .. } => writer.finish(),
            Backend::Cached(_) => Ok(()),
        }
    }
}

fn read_bursts(path: &Path) -> Result<Vec<Burst>, ModelError> {
    if !path.is_file() {
        return Err(ModelError::MissingInput(path.display().to_string()));
    }
    Ok(RecordReader::<Burst>::open(vec![path.to_path_buf()], false)?.collect::<Result<_, _>>()?)
}

/// Every sample file of `stem`: complete, out-of-order and dangling.
fn sample_files(root: &Path, stem: &str) -> Result<Vec<PathBuf>, ModelError> {
    let mut files = Vec::new();
    for kind in ["sample", "ooo", "dangling"] {
        files.extend(numbered_files(root, &format!("{kind}_{stem}"))?);
    }
    if files.is_empty() {
        return Err(ModelError::MissingInput(format!(
            "{}/*_{stem}.N",
            root.display()
        )));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst(instr_begin: u64, instr_end: u64) -> Burst {
        Burst {
            instr_begin,
            instr_end,
            ..Default::default()
        }
    }

    #[test]
    fn window_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let bench = dir.path().join("bench");
        std::fs::create_dir(&bench).unwrap();
        let bursts = [burst(0, 100), burst(100, 200), burst(200, 300), burst(300, 400)];
        let mut writer =
            crate::trace::RecordWriter::new(std::fs::File::create(bench.join("burst_data.0")).unwrap());
        for b in &bursts {
            writer.write(b).unwrap();
        }
        writer.into_inner().unwrap();
        std::fs::write(bench.join("sample_data.0"), b"").unwrap();

        let mut ss = Statstack::open(
            dir.path(),
            "bench",
            Source::Data,
            AccessKind::Load,
            false,
            false,
            Diagnostics::disabled("bench", "statstack"),
        )
        .unwrap();
        let aligned = ss.align_bursts(&[(0, 150), (150, 250), (250, 400)]);
        assert_eq!(aligned, vec![vec![0, 1], vec![1, 2], vec![2, 3]]);
    }
}
