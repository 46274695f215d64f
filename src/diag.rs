//! Per-benchmark diagnostic logs.
//!
//! Every message is emitted as a `tracing` event and appended to
//! `<output>/<benchmark>/<component>/log.out` (or `errors.out` for
//! reconciliation and consistency errors).

use std::{
    fmt::Display,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use crate::error::ModelError;

#[derive(Debug, Clone, Copy)]
enum Sink {
    Log,
    Errors,
}

impl Sink {
    fn file_name(self) -> &'static str {
        match self {
            Sink::Log => "log.out",
            Sink::Errors => "errors.out",
        }
    }
}

/// Open handles of one component's log files, opened on first use.
#[derive(Debug)]
struct Files {
    dir: PathBuf,
    log: Option<BufWriter<File>>,
    errors: Option<BufWriter<File>>,
}

impl Files {
    fn writer(&mut self, sink: Sink) -> io::Result<&mut BufWriter<File>> {
        let slot = match sink {
            Sink::Log => &mut self.log,
            Sink::Errors => &mut self.errors,
        };
        if slot.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(sink.file_name()))?;
            *slot = Some(BufWriter::new(file));
        }
        match slot {
            Some(w) => Ok(w),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in [&mut self.log, &mut self.errors].into_iter().flatten() {
            w.flush()?;
        }
        Ok(())
    }
}

/// Clones share the same open files.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    benchmark: String,
    component: &'static str,
    files: Option<Arc<Mutex<Files>>>,
}

impl Diagnostics {
    pub fn new(output: &Path, benchmark: &str, component: &'static str) -> Result<Self, ModelError> {
        let dir = output.join(benchmark).join(component);
        fs::create_dir_all(&dir).map_err(|e| ModelError::io(&dir, e))?;
        Ok(Diagnostics {
            benchmark: benchmark.to_string(),
            component,
            files: Some(Arc::new(Mutex::new(Files {
                dir,
                log: None,
                errors: None,
            }))),
        })
    }

    /// Diagnostics that only reach the `tracing` subscriber.
    pub fn disabled(benchmark: &str, component: &'static str) -> Self {
        Diagnostics {
            benchmark: benchmark.to_string(),
            component,
            files: None,
        }
    }

    pub fn info(&self, msg: impl Display) {
        tracing::debug!(benchmark = %self.benchmark, component = self.component, "{msg}");
        self.append(Sink::Log, &msg);
    }

    pub fn warn(&self, msg: impl Display) {
        tracing::warn!(benchmark = %self.benchmark, component = self.component, "{msg}");
        self.append(Sink::Log, &format_args!("Warning: {msg}"));
    }

    pub fn error(&self, msg: impl Display) {
        tracing::error!(benchmark = %self.benchmark, component = self.component, "{msg}");
        self.append(Sink::Errors, &msg);
    }

    /// Writes out buffered messages. Also happens when the last clone is
    /// dropped.
    pub fn flush(&self) {
        let Some(files) = &self.files else { return };
        let mut files = files.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = files.flush() {
            tracing::error!(dir = %files.dir.display(), "cannot write diagnostics: {err}");
        }
    }

    fn append(&self, sink: Sink, msg: &dyn Display) {
        let Some(files) = &self.files else { return };
        let mut files = files.lock().unwrap_or_else(PoisonError::into_inner);
        let written = files.writer(sink).and_then(|w| writeln!(w, "{msg}"));
        if let Err(err) = written {
            tracing::error!(
                path = %files.dir.join(sink.file_name()).display(),
                "cannot write diagnostics: {err}"
            );
        }
    }
}
