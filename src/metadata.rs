use std::{collections::HashMap, fs, path::Path};

use crate::error::MetadataError;

const BEGIN: &str = "--BEGIN METADATA--";
const END: &str = "--END METADATA--";

/// Facts the profiler recorded about one benchmark run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileMetadata {
    pub compressed: bool,
    pub sample_rate: u64,
    pub trace_window: Option<u64>,
    /// `[start, end)` instruction bounds of every analysed window.
    pub windows: Vec<(u64, u64)>,
    pub params: HashMap<String, String>,
}

impl ProfileMetadata {
    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let text = fs::read_to_string(path).map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, MetadataError> {
        let params = parse_params(text)?;
        let number = |key: &'static str| -> Result<u64, MetadataError> {
            let value = params.get(key).ok_or(MetadataError::MissingKey(key))?;
            value.parse().map_err(|_| MetadataError::NotANumber {
                key,
                value: value.clone(),
            })
        };
        let compressed = number("enable_compression")? != 0;
        let sample_rate = number("p")?;
        let trace_window = if params.contains_key("trace_window") {
            Some(number("trace_window")?)
        } else {
            None
        };
        let windows = parse_windows(text)?;
        Ok(ProfileMetadata {
            compressed,
            sample_rate,
            trace_window,
            windows,
            params,
        })
    }
}

fn parse_params(text: &str) -> Result<HashMap<String, String>, MetadataError> {
    let mut params = HashMap::new();
    let mut inside = false;
    for line in text.lines() {
        let line = line.trim_end();
        if line == BEGIN {
            inside = true;
            continue;
        }
        if line == END {
            break;
        }
        if !inside || line.is_empty() || line.starts_with("VERSION") || line.contains("configuration") {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                params.insert(key.to_string(), value.to_string());
            }
            _ => return Err(MetadataError::BadLine(line.to_string())),
        }
    }
    Ok(params)
}

/// `Window started at N` / `Window ended at N` pairs. The number is the last
/// word before the first comma.
fn parse_windows(text: &str) -> Result<Vec<(u64, u64)>, MetadataError> {
    let marker_value = |line: &str| -> Option<u64> {
        line.split(',').next()?.split_whitespace().last()?.parse().ok()
    };
    let mut windows = Vec::new();
    let mut open: Option<u64> = None;
    for (n, line) in text.lines().enumerate() {
        if line.contains("Window started") {
            if open.is_some() {
                return Err(MetadataError::WindowMarker(n + 1));
            }
            open = Some(marker_value(line).ok_or(MetadataError::WindowMarker(n + 1))?);
        } else if line.contains("Window ended") {
            let start = open.take().ok_or(MetadataError::WindowMarker(n + 1))?;
            let end = marker_value(line)
                .filter(|&end| end >= start)
                .ok_or(MetadataError::WindowMarker(n + 1))?;
            windows.push((start, end));
        }
    }
    if open.is_some() {
        return Err(MetadataError::WindowMarker(text.lines().count()));
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
[PINTOOL] starting
--BEGIN METADATA--
VERSION 3
enable_compression 1
p 1000
trace_window 1000000
sampler configuration follows
--END METADATA--
[PINTOOL] Window started at 901000009
[PINTOOL] Window ended at 902000007, 12 bursts
[PINTOOL] Window started at 903000000
[PINTOOL] Window ended at 904000000
";

    #[test]
    fn parses_params_and_windows() {
        let meta = ProfileMetadata::parse(LOG).unwrap();
        assert!(meta.compressed);
        assert_eq!(meta.sample_rate, 1000);
        assert_eq!(meta.trace_window, Some(1_000_000));
        assert_eq!(
            meta.windows,
            vec![(901000009, 902000007), (903000000, 904000000)]
        );
        assert!(!meta.params.contains_key("VERSION"));
    }

    #[test]
    fn missing_sample_rate() {
        let log = "--BEGIN METADATA--\nenable_compression 0\n--END METADATA--\n";
        assert!(matches!(
            ProfileMetadata::parse(log),
            Err(MetadataError::MissingKey("p"))
        ));
    }

    #[test]
    fn unmatched_window_marker() {
        let log = "--BEGIN METADATA--\nenable_compression 0\np 1\n--END METADATA--\nWindow started at 5\n";
        assert!(matches!(
            ProfileMetadata::parse(log),
            Err(MetadataError::WindowMarker(_))
        ));
    }

    #[test]
    fn window_ending_before_its_start() {
        let log = "--BEGIN METADATA--\nenable_compression 0\np 1\n--END METADATA--\n\
                   Window started at 100\nWindow ended at 50\n";
        assert!(matches!(
            ProfileMetadata::parse(log),
            Err(MetadataError::WindowMarker(6))
        ));
    }
}
