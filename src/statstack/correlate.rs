//! Reconstruction of per-burst reuse histograms from the profiler's three
//! sample streams.
//!
//! The streams are consumed incrementally: each call handles the next set of
//! requested bursts and leaves every stream positioned (with at most one
//! look-ahead sample held back) for the following call.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{
    diag::Diagnostics,
    error::{ModelError, TraceError},
    records::{AccessEvent, AccessKind, Burst, Sample},
    trace::{numbered_files, RecordReader},
};

use super::hist::{Histogram, PcHistograms, INFINITE};

/// Which access of a pair a histogram is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keyed by the landing burst, filtered on the landing access type.
    Burst,
    /// Keyed by the takeoff burst and split per takeoff PC.
    Pc,
}

impl Resolution {
    fn event(self, sample: &Sample) -> &AccessEvent {
        match (self, &sample.end) {
            (Resolution::Burst, Some(end)) => end,
            _ => &sample.begin,
        }
    }

    fn expected(self, kind: AccessKind, burst: &Burst) -> u64 {
        match (self, kind) {
            (Resolution::Burst, AccessKind::Load) => burst.landing_loads,
            (Resolution::Burst, AccessKind::Store) => burst.landing_stores,
            (Resolution::Pc, AccessKind::Load) => burst.takeoff_loads,
            (Resolution::Pc, AccessKind::Store) => burst.takeoff_stores,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Idle,
    Holding(Sample),
    Exhausted,
}

struct Stream {
    reader: RecordReader<Sample>,
    cursor: Cursor,
}

impl Stream {
    fn open(files: Vec<PathBuf>, compressed: bool) -> Result<Option<Self>, TraceError> {
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(Stream {
            reader: RecordReader::open(files, compressed)?,
            cursor: Cursor::Idle,
        }))
    }

    fn is_holding(&self) -> bool {
        matches!(self.cursor, Cursor::Holding(_))
    }

    /// Drops any held sample and pulls the next one from the file.
    fn pull(&mut self) -> Result<Option<Sample>, TraceError> {
        if let Cursor::Exhausted = self.cursor {
            return Ok(None);
        }
        match self.reader.read_record()? {
            Some(sample) => {
                self.cursor = Cursor::Idle;
                Ok(Some(sample))
            }
            None => {
                self.cursor = Cursor::Exhausted;
                Ok(None)
            }
        }
    }
}

/// Per-burst reuse histograms produced by one correlation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReuseHistograms {
    pub bursts: BTreeMap<usize, Histogram>,
    pub per_pc: BTreeMap<usize, PcHistograms>,
}

struct Pass<'a> {
    requested: &'a [usize],
    remaining: i64,
    resolution: Resolution,
    out: ReuseHistograms,
}

impl Pass<'_> {
    fn is_requested(&self, burst: usize) -> bool {
        self.requested.binary_search(&burst).is_ok()
    }

    fn first(&self) -> usize {
        self.requested[0]
    }

    fn last(&self) -> usize {
        self.requested[self.requested.len() - 1]
    }

    fn record(&mut self, burst: usize, sample: &Sample) {
        let rdist = sample.reuse_distance().unwrap_or(INFINITE);
        self.out.bursts.entry(burst).or_default().add(rdist, 1);
        if self.resolution == Resolution::Pc {
            self.out
                .per_pc
                .entry(burst)
                .or_default()
                .entry(sample.begin.program_counter)
                .or_default()
                .add(rdist, 1);
        }
    }
}

pub struct Correlator {
    kind: AccessKind,
    resolution: Resolution,
    complete: Option<Stream>,
    ooo: Vec<Stream>,
    dangling: Option<Stream>,
}

impl Correlator {
    /// Opens `sample_<source>.N`, every `ooo_<source>.N` on its own, and
    /// `dangling_<source>.N` in `dir`.
    pub fn open(
        dir: &Path,
        source: &str,
        kind: AccessKind,
        resolution: Resolution,
        compressed: bool,
    ) -> Result<Self, TraceError> {
        let complete = Stream::open(numbered_files(dir, &format!("sample_{source}"))?, compressed)?;
        let dangling = Stream::open(numbered_files(dir, &format!("dangling_{source}"))?, compressed)?;
        // OoO files are each sorted, but not with respect to one another.
        let mut ooo = Vec::new();
        for file in numbered_files(dir, &format!("ooo_{source}"))? {
            ooo.extend(Stream::open(vec![file], compressed)?);
        }
        Ok(Correlator {
            kind,
            resolution,
            complete,
            ooo,
            dangling,
        })
    }

    fn wanted(&self, sample: &Sample) -> bool {
        self.resolution.event(sample).access_type == self.kind
    }

    /// Reuse histograms for `requested` (ascending burst indices), each
    /// present even when no access of this kind landed in it.
    pub fn correlate(
        &mut self,
        bursts: &[Burst],
        requested: &[usize],
        diag: &Diagnostics,
    ) -> Result<ReuseHistograms, ModelError> {
        if requested.is_empty() {
            return Ok(ReuseHistograms::default());
        }
        let mut expected = 0;
        for &b in requested {
            let burst = bursts.get(b).ok_or(ModelError::BurstOutOfRange {
                burst: b,
                len: bursts.len(),
            })?;
            expected += self.resolution.expected(self.kind, burst);
        }
        let mut pass = Pass {
            requested,
            remaining: expected as i64,
            resolution: self.resolution,
            out: ReuseHistograms::default(),
        };

        self.dangling_pass(&mut pass)?;
        if pass.remaining != 0 {
            self.ooo_pass(&mut pass)?;
        }
        if pass.remaining > 0 {
            self.complete_pass(&mut pass)?;
        }

        if pass.remaining > 0 {
            diag.error(format_args!(
                "{} memory operations left unmatched for bursts {:?}",
                pass.remaining, requested
            ));
            return Err(ModelError::Correlation {
                remaining: pass.remaining,
                bursts: requested.to_vec(),
            });
        }
        if pass.remaining < 0 {
            diag.warn(format_args!(
                "found {} more memory operations than announced for bursts {:?}",
                -pass.remaining,
                requested
            ));
        }

        for &b in requested {
            pass.out.bursts.entry(b).or_default();
            if self.resolution == Resolution::Pc {
                pass.out.per_pc.entry(b).or_default();
            }
        }
        Ok(pass.out)
    }

    /// Cold accesses, keyed by the burst of the unmatched access.
    fn dangling_pass(&mut self, pass: &mut Pass<'_>) -> Result<(), TraceError> {
        let kind = self.kind;
        let Some(stream) = self.dangling.as_mut() else {
            return Ok(());
        };
        let mut check_next = false;
        if let Cursor::Holding(held) = stream.cursor {
            let burst = held.begin.burst_id;
            if pass.is_requested(burst) {
                pass.record(burst, &Sample { end: None, ..held });
                pass.remaining -= 1;
                stream.cursor = Cursor::Idle;
                check_next = true;
            } else if burst < pass.first() {
                check_next = true;
            }
        }
        if !stream.is_holding() || check_next {
            while let Some(sample) = stream.pull()? {
                if sample.begin.access_type != kind {
                    continue;
                }
                let burst = sample.begin.burst_id;
                if burst > pass.last() {
                    stream.cursor = Cursor::Holding(sample);
                    break;
                }
                if pass.is_requested(burst) {
                    pass.record(burst, &Sample { end: None, ..sample });
                    pass.remaining -= 1;
                }
            }
        }
        Ok(())
    }

    /// Out-of-order pairs, one stream per file.
    ///
    /// Once any stream has advanced in this pass, every later stream rescans
    /// as well, even when its held sample lies past the requested bursts; that
    /// held sample is then replaced by the next one.
    fn ooo_pass(&mut self, pass: &mut Pass<'_>) -> Result<(), TraceError> {
        let mut check_next = false;
        for i in 0..self.ooo.len() {
            if let Cursor::Holding(held) = self.ooo[i].cursor {
                if self.wanted(&held) {
                    let burst = self.resolution.event(&held).burst_id;
                    if pass.is_requested(burst) {
                        pass.record(burst, &held);
                        pass.remaining -= 1;
                        self.ooo[i].cursor = Cursor::Idle;
                        check_next = true;
                    }
                    if burst < pass.first() {
                        check_next = true;
                    }
                }
            }
            if self.ooo[i].is_holding() && !check_next {
                continue;
            }
            while let Some(sample) = self.ooo[i].pull()? {
                if !self.wanted(&sample) {
                    continue;
                }
                let burst = self.resolution.event(&sample).burst_id;
                if burst > pass.last() {
                    self.ooo[i].cursor = Cursor::Holding(sample);
                    break;
                }
                if pass.is_requested(burst) {
                    pass.record(burst, &sample);
                    pass.remaining -= 1;
                }
            }
        }
        Ok(())
    }

    /// The bulk of the pairs. Samples outside the requested bursts are
    /// skipped; the pass stops as soon as the expected count is reached.
    fn complete_pass(&mut self, pass: &mut Pass<'_>) -> Result<(), TraceError> {
        let kind = self.kind;
        let resolution = self.resolution;
        let Some(stream) = self.complete.as_mut() else {
            return Ok(());
        };
        while let Some(sample) = stream.pull()? {
            let event = resolution.event(&sample);
            if event.access_type != kind || !pass.is_requested(event.burst_id) {
                continue;
            }
            pass.record(event.burst_id, &sample);
            pass.remaining -= 1;
            if pass.remaining == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::trace::RecordWriter;

    fn event(burst_id: usize, access_counter: u64, pc: u64, access_type: AccessKind) -> AccessEvent {
        AccessEvent {
            burst_id,
            access_counter,
            program_counter: pc,
            memory_address: 0x1000,
            access_type,
            thread_id: 0,
        }
    }

    fn pair(takeoff: usize, landing: usize, rdist: u64) -> Sample {
        Sample {
            begin: event(takeoff, 100, 0x40, AccessKind::Load),
            end: Some(event(landing, 100 + rdist + 1, 0x44, AccessKind::Load)),
        }
    }

    fn cold(burst: usize, access_type: AccessKind) -> Sample {
        Sample {
            begin: event(burst, 7, 0x48, access_type),
            end: None,
        }
    }

    fn write(dir: &Path, name: &str, samples: &[Sample]) {
        let mut writer = RecordWriter::new(fs::File::create(dir.join(name)).unwrap());
        for s in samples {
            writer.write(s).unwrap();
        }
        writer.into_inner().unwrap();
    }

    fn loads(landing_loads: u64) -> Burst {
        Burst {
            landing_loads,
            takeoff_loads: landing_loads,
            ..Default::default()
        }
    }

    fn quiet() -> Diagnostics {
        Diagnostics::disabled("test", "statstack")
    }

    #[test]
    fn resumes_with_held_lookahead() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "dangling_data.0",
            &[cold(0, AccessKind::Load), cold(0, AccessKind::Store), cold(1, AccessKind::Load)],
        );
        write(
            dir.path(),
            "sample_data.0",
            &[pair(0, 0, 3), pair(0, 0, 5), pair(0, 1, 9), pair(1, 1, 2)],
        );
        let bursts = vec![loads(3), loads(3)];
        let mut c = Correlator::open(dir.path(), "data", AccessKind::Load, Resolution::Burst, false)
            .unwrap();

        let first = c.correlate(&bursts, &[0], &quiet()).unwrap();
        assert_eq!(first.bursts[&0].to_pairs(), vec![(3, 1), (5, 1), (INFINITE, 1)]);

        let second = c.correlate(&bursts, &[1], &quiet()).unwrap();
        assert_eq!(second.bursts[&1].to_pairs(), vec![(2, 1), (9, 1), (INFINITE, 1)]);
    }

    #[test]
    fn unmatched_operations_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sample_data.0", &[pair(0, 0, 1)]);
        let bursts = vec![loads(2)];
        let mut c = Correlator::open(dir.path(), "data", AccessKind::Load, Resolution::Burst, false)
            .unwrap();
        match c.correlate(&bursts, &[0], &quiet()) {
            Err(ModelError::Correlation { remaining, bursts }) => {
                assert_eq!(remaining, 1);
                assert_eq!(bursts, vec![0]);
            }
            other => panic!("expected a correlation error, got {other:?}"),
        }
    }

    #[test]
    fn bursts_without_events_get_empty_histograms() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sample_data.0", &[pair(0, 0, 1)]);
        let bursts = vec![loads(1), loads(0), loads(0)];
        let mut c = Correlator::open(dir.path(), "data", AccessKind::Load, Resolution::Burst, false)
            .unwrap();
        let got = c.correlate(&bursts, &[0, 1, 2], &quiet()).unwrap();
        assert_eq!(got.bursts.len(), 3);
        assert!(got.bursts[&1].is_empty());
        assert!(got.bursts[&2].is_empty());
    }

    #[test]
    fn warmup_samples_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "sample_data.0",
            &[pair(0, 0, 1), pair(0, 0, 2), pair(1, 2, 4)],
        );
        let bursts = vec![loads(2), loads(0), loads(1)];
        let mut c = Correlator::open(dir.path(), "data", AccessKind::Load, Resolution::Burst, false)
            .unwrap();
        let got = c.correlate(&bursts, &[2], &quiet()).unwrap();
        assert_eq!(got.bursts[&2].to_pairs(), vec![(4, 1)]);
    }

    #[test]
    fn pc_resolution_keys_by_takeoff() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sample_trace.0", &[pair(0, 1, 6), pair(0, 0, 2)]);
        let bursts = vec![loads(2), loads(0)];
        let mut c = Correlator::open(dir.path(), "trace", AccessKind::Load, Resolution::Pc, false)
            .unwrap();
        let got = c.correlate(&bursts, &[0], &quiet()).unwrap();
        assert_eq!(got.bursts[&0].to_pairs(), vec![(2, 1), (6, 1)]);
        assert_eq!(got.per_pc[&0][&0x40].to_pairs(), vec![(2, 1), (6, 1)]);
    }

    #[test]
    fn ooo_files_are_read_independently() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ooo_data.0", &[pair(0, 1, 30)]);
        write(dir.path(), "ooo_data.1", &[pair(0, 0, 20), pair(0, 1, 40)]);
        write(dir.path(), "sample_data.0", &[]);
        let bursts = vec![loads(1), loads(2)];
        let mut c = Correlator::open(dir.path(), "data", AccessKind::Load, Resolution::Burst, false)
            .unwrap();
        let first = c.correlate(&bursts, &[0], &quiet()).unwrap();
        assert_eq!(first.bursts[&0].to_pairs(), vec![(20, 1)]);
        let second = c.correlate(&bursts, &[1], &quiet()).unwrap();
        assert_eq!(second.bursts[&1].to_pairs(), vec![(30, 1), (40, 1)]);
    }

    /// Once the first OoO stream advances, the second one rescans and loses
    /// the look-ahead it held for a later burst. That burst then comes up
    /// short.
    #[test]
    fn ooo_lookahead_is_replaced_once_an_earlier_stream_advanced() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ooo_data.0", &[pair(0, 0, 1), pair(0, 1, 2)]);
        write(dir.path(), "ooo_data.1", &[pair(0, 2, 3), pair(0, 3, 4)]);
        write(dir.path(), "sample_data.0", &[]);
        let bursts = vec![loads(1), loads(1), loads(1), loads(1)];
        let mut c = Correlator::open(dir.path(), "data", AccessKind::Load, Resolution::Burst, false)
            .unwrap();

        assert_eq!(
            c.correlate(&bursts, &[0], &quiet()).unwrap().bursts[&0].to_pairs(),
            vec![(1, 1)]
        );
        assert_eq!(
            c.correlate(&bursts, &[1], &quiet()).unwrap().bursts[&1].to_pairs(),
            vec![(2, 1)]
        );
        assert!(matches!(
            c.correlate(&bursts, &[2], &quiet()),
            Err(ModelError::Correlation { remaining: 1, .. })
        ));
    }
}
