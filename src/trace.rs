//! Length-prefixed record streams.
//!
//! Every input the profiler produces is a sequence of records, each one a
//! LEB128 length followed by that many payload bytes. A stream may span
//! several files (`sample_data.0`, `sample_data.1`, ...) and each file may be
//! wrapped in a gzip or xz stream.

use std::{
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use flate2::read::MultiGzDecoder;
use xz2::read::XzDecoder;

use crate::error::TraceError;

const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];

/// A record type that can be carried in a length-prefixed stream.
pub trait Record: Sized {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError>;
    fn encode(&self, out: &mut Vec<u8>);
}

pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn varint_from_slice(buf: &mut &[u8]) -> Option<Result<u64, TraceError>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = buf.split_first()?;
        *buf = rest;
        if shift >= 64 {
            return Some(Err(TraceError::VarintOverflow));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(Ok(value));
        }
        shift += 7;
    }
}

/// Sequential access to the varint fields of one record payload.
pub struct Fields<'a> {
    buf: &'a [u8],
    read: usize,
}

impl<'a> Fields<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Fields { buf, read: 0 }
    }

    pub fn next(&mut self) -> Result<u64, TraceError> {
        match varint_from_slice(&mut self.buf) {
            Some(Ok(value)) => {
                self.read += 1;
                Ok(value)
            }
            Some(Err(err)) => Err(err),
            None => Err(TraceError::ShortPayload { read: self.read }),
        }
    }

    pub fn next_usize(&mut self) -> Result<usize, TraceError> {
        self.next().map(|v| v as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reads a count followed by that many `(a, b)` pairs.
    pub fn pairs(&mut self) -> Result<Vec<(u64, u64)>, TraceError> {
        let len = self.next_usize()?;
        (0..len).map(|_| Ok((self.next()?, self.next()?))).collect()
    }
}

pub fn put_pairs(out: &mut Vec<u8>, pairs: &[(u64, u64)]) {
    put_varint(out, pairs.len() as u64);
    for &(a, b) in pairs {
        put_varint(out, a);
        put_varint(out, b);
    }
}

fn open_stream(path: &Path, compressed: bool) -> Result<Box<dyn BufRead + Send>, TraceError> {
    let io_err = |source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = BufReader::new(fs::File::open(path).map_err(io_err)?);
    if !compressed {
        return Ok(Box::new(file));
    }
    let (empty, xz) = {
        let head = file.fill_buf().map_err(io_err)?;
        (head.is_empty(), head.starts_with(&XZ_MAGIC))
    };
    if empty {
        Ok(Box::new(file))
    } else if xz {
        Ok(Box::new(BufReader::new(XzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    }
}

fn read_byte(stream: &mut dyn BufRead) -> io::Result<Option<u8>> {
    let byte = match stream.fill_buf()?.first() {
        Some(&b) => b,
        None => return Ok(None),
    };
    stream.consume(1);
    Ok(Some(byte))
}

/// Reads records of one type from an ordered list of files, continuing into
/// the next file when one is exhausted.
pub struct RecordReader<R> {
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<Box<dyn BufRead + Send>>,
    compressed: bool,
    payload: Vec<u8>,
    failed: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> RecordReader<R> {
    pub fn open(files: Vec<PathBuf>, compressed: bool) -> Result<Self, TraceError> {
        if files.is_empty() {
            return Err(TraceError::NoFiles);
        }
        let current = Some(open_stream(&files[0], compressed)?);
        Ok(RecordReader {
            files,
            next_file: 1,
            current,
            compressed,
            payload: Vec::new(),
            failed: false,
            _record: PhantomData,
        })
    }

    fn path(&self) -> PathBuf {
        self.files[self.next_file - 1].clone()
    }

    /// Returns the next record, or `None` once the last file is exhausted.
    pub fn read_record(&mut self) -> Result<Option<R>, TraceError> {
        loop {
            let Some(stream) = self.current.as_mut() else {
                return Ok(None);
            };
            match read_length(stream.as_mut()) {
                Ok(Some(len)) => {
                    self.payload.clear();
                    let read = stream.as_mut().take(len).read_to_end(&mut self.payload);
                    match read {
                        Ok(n) if n as u64 == len => {}
                        Ok(_) => return Err(TraceError::Truncated { path: self.path() }),
                        Err(err) => return Err(self.stream_error(err)),
                    }
                    let mut fields = Fields::new(&self.payload);
                    return R::decode(&mut fields).map(Some);
                }
                Ok(None) => {
                    self.current = match self.files.get(self.next_file) {
                        Some(next) => Some(open_stream(next, self.compressed)?),
                        None => None,
                    };
                    self.next_file += 1;
                }
                Err(LengthError::Io(err)) => return Err(self.stream_error(err)),
                Err(LengthError::Truncated) => {
                    return Err(TraceError::Truncated { path: self.path() })
                }
                Err(LengthError::Overflow) => return Err(TraceError::VarintOverflow),
            }
        }
    }

    fn stream_error(&self, err: io::Error) -> TraceError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            TraceError::Truncated { path: self.path() }
        } else {
            TraceError::Io {
                path: self.path(),
                source: err,
            }
        }
    }
}

enum LengthError {
    Io(io::Error),
    Truncated,
    Overflow,
}

fn read_length(stream: &mut dyn BufRead) -> Result<Option<u64>, LengthError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = match read_byte(stream).map_err(LengthError::Io)? {
            Some(b) => b,
            None if shift == 0 => return Ok(None),
            None => return Err(LengthError::Truncated),
        };
        if shift >= 64 {
            return Err(LengthError::Overflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

impl<R: Record> Iterator for RecordReader<R> {
    type Item = Result<R, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_record() {
            Ok(record) => record.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Writes length-prefixed records to any sink.
pub struct RecordWriter<W: Write> {
    sink: W,
    payload: Vec<u8>,
    header: Vec<u8>,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(sink: W) -> Self {
        RecordWriter {
            sink,
            payload: Vec::new(),
            header: Vec::new(),
        }
    }

    pub fn write<R: Record>(&mut self, record: &R) -> io::Result<()> {
        self.payload.clear();
        self.header.clear();
        record.encode(&mut self.payload);
        put_varint(&mut self.header, self.payload.len() as u64);
        self.sink.write_all(&self.header)?;
        self.sink.write_all(&self.payload)
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// Lists `<dir>/<stem>.<n>` files ordered by `n`.
pub fn numbered_files(dir: &Path, stem: &str) -> Result<Vec<PathBuf>, TraceError> {
    let io_err = |source| TraceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let prefix = format!("{stem}.");
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        found.push((index, entry.path()));
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}
