use std::{fs, io::Write, path::Path};

use flate2::{write::GzEncoder, Compression};
use memstack::{
    error::TraceError,
    records::Burst,
    trace::{numbered_files, RecordReader, RecordWriter},
};
use pretty_assertions::assert_eq;
use xz2::write::XzEncoder;

fn bursts(from: u64, n: u64) -> Vec<Burst> {
    (from..from + n)
        .map(|i| Burst {
            instr_begin: i * 1000,
            instr_end: i * 1000 + 500,
            memaccess_begin: i * 300,
            memaccess_end: i * 300 + 150,
            takeoff_loads: i,
            landing_loads: i + 1,
            ..Default::default()
        })
        .collect()
}

fn encode(records: &[Burst]) -> Vec<u8> {
    let mut writer = RecordWriter::new(Vec::new());
    for r in records {
        writer.write(r).unwrap();
    }
    writer.into_inner().unwrap()
}

fn write_xz(path: &Path, records: &[Burst]) {
    let mut enc = XzEncoder::new(fs::File::create(path).unwrap(), 6);
    enc.write_all(&encode(records)).unwrap();
    enc.finish().unwrap();
}

fn write_gz(path: &Path, records: &[Burst]) {
    let mut enc = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
    enc.write_all(&encode(records)).unwrap();
    enc.finish().unwrap();
}

#[test]
fn mixed_compression_across_files() {
    let dir = tempfile::tempdir().unwrap();
    write_xz(&dir.path().join("burst_data.0"), &bursts(0, 3));
    write_gz(&dir.path().join("burst_data.1"), &bursts(3, 2));
    write_xz(&dir.path().join("burst_data.2"), &bursts(5, 4));

    let files = numbered_files(dir.path(), "burst_data").unwrap();
    assert_eq!(files.len(), 3);
    let read: Vec<Burst> = RecordReader::<Burst>::open(files, true)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(read, bursts(0, 9));
}

#[test]
fn uncompressed_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("burst_data.0"), encode(&bursts(0, 2))).unwrap();
    fs::write(dir.path().join("burst_data.1"), encode(&[])).unwrap();
    fs::write(dir.path().join("burst_data.2"), encode(&bursts(2, 1))).unwrap();

    let files = numbered_files(dir.path(), "burst_data").unwrap();
    let read: Vec<Burst> = RecordReader::<Burst>::open(files, false)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(read, bursts(0, 3));
}

#[test]
fn cut_off_compressed_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = encode(&bursts(0, 2));
    bytes.truncate(bytes.len() - 3);
    let path = dir.path().join("burst_data.0");
    let mut enc = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
    enc.write_all(&bytes).unwrap();
    enc.finish().unwrap();

    let mut reader = RecordReader::<Burst>::open(vec![path], true).unwrap();
    assert_eq!(reader.read_record().unwrap(), Some(bursts(0, 1)[0]));
    assert!(matches!(reader.read_record(), Err(TraceError::Truncated { .. })));
}
