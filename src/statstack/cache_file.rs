//! On-disk cache of derived stack-distance histograms.
//!
//! A cache file holds one record per burst in the order the bursts were
//! first requested. It is written under a `.partial` name and only renamed
//! into place once the benchmark completed, so an interrupted run never
//! leaves a file that later runs would trust.

use std::{
    fs,
    io::BufWriter,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use crate::{
    error::ModelError,
    records::{PcSdHistRecord, SdHistRecord},
    trace::{Record, RecordReader, RecordWriter},
};

use super::{hist::Histogram, vicinity::StackDistances};

/// Stack distances as stored for one resolution.
pub trait CachedHistogram: Record {
    fn burst_id(&self) -> usize;
    fn from_distances(burst: usize, sd: &StackDistances) -> Self;
    fn into_distances(self) -> StackDistances;
}

impl CachedHistogram for SdHistRecord {
    fn burst_id(&self) -> usize {
        self.burst_id
    }

    fn from_distances(burst: usize, sd: &StackDistances) -> Self {
        SdHistRecord {
            burst_id: burst,
            counts: sd.hist.to_pairs(),
        }
    }

    fn into_distances(self) -> StackDistances {
        StackDistances {
            hist: self.counts.into_iter().collect(),
            per_pc: Default::default(),
        }
    }
}

impl CachedHistogram for PcSdHistRecord {
    fn burst_id(&self) -> usize {
        self.burst_id
    }

    fn from_distances(burst: usize, sd: &StackDistances) -> Self {
        PcSdHistRecord {
            burst_id: burst,
            pcs: sd.per_pc.iter().map(|(&pc, h)| (pc, h.to_pairs())).collect(),
        }
    }

    fn into_distances(self) -> StackDistances {
        let mut out = StackDistances::default();
        for (pc, counts) in self.pcs {
            let pc_hist: Histogram = counts.into_iter().collect();
            out.hist.merge(&pc_hist);
            out.per_pc.insert(pc, pc_hist);
        }
        out
    }
}

pub struct CacheReader<C> {
    path: PathBuf,
    reader: RecordReader<C>,
}

impl<C: CachedHistogram> CacheReader<C> {
    pub fn open(path: &Path) -> Result<Self, ModelError> {
        Ok(CacheReader {
            path: path.to_path_buf(),
            reader: RecordReader::open(vec![path.to_path_buf()], false)?,
        })
    }

    /// Reads the next record, which must belong to `burst`.
    pub fn next_burst(&mut self, burst: usize) -> Result<StackDistances, ModelError> {
        let record = self
            .reader
            .read_record()?
            .ok_or_else(|| ModelError::CacheExhausted(self.path.clone()))?;
        if record.burst_id() != burst {
            return Err(ModelError::CacheMismatch {
                expected: burst,
                found: record.burst_id(),
            });
        }
        Ok(record.into_distances())
    }
}

/// Writer of one cache file. The partial file is removed when the writer is
/// dropped without [`CacheWriter::finish`].
pub struct CacheWriter<C> {
    path: PathBuf,
    partial: PathBuf,
    writer: Option<RecordWriter<BufWriter<fs::File>>>,
    _record: PhantomData<fn(C)>,
}

impl<C: CachedHistogram> CacheWriter<C> {
    pub fn create(path: &Path) -> Result<Self, ModelError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ModelError::io(dir, e))?;
        }
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        let file = fs::File::create(&partial).map_err(|e| ModelError::io(&partial, e))?;
        Ok(CacheWriter {
            path: path.to_path_buf(),
            partial,
            writer: Some(RecordWriter::new(BufWriter::new(file))),
            _record: PhantomData,
        })
    }

    pub fn write(&mut self, burst: usize, sd: &StackDistances) -> Result<(), ModelError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer
            .write(&C::from_distances(burst, sd))
            .map_err(|e| ModelError::io(&self.partial, e))
    }

    /// Flushes the partial file and moves it to its final name.
    pub fn finish(mut self) -> Result<(), ModelError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let done = writer
            .into_inner()
            .map_err(|e| ModelError::io(&self.partial, e))
            .and_then(|_| {
                fs::rename(&self.partial, &self.path).map_err(|e| ModelError::io(&self.path, e))
            });
        if done.is_err() {
            let _ = fs::remove_file(&self.partial);
        }
        done
    }
}

impl<C> Drop for CacheWriter<C> {
    fn drop(&mut self) {
        if self.writer.take().is_none() {
            return;
        }
        if let Err(err) = fs::remove_file(&self.partial) {
            tracing::warn!("cannot remove {}: {err}", self.partial.display());
        }
    }
}
