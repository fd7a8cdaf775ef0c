//! Durable append-only CSV sink for records.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{MonitorError, Result};
use crate::record::{header_line, Record};

/// Default number of records buffered between flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 32;

/// Resolve a data file path: relative paths land under `data_dir`,
/// absolute paths are used verbatim.
pub fn resolve_path(path: &Path, data_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

/// Byte destination behind a [`RecordSink`].
pub(crate) trait SinkTarget: Write + Send + fmt::Debug {
    /// Make written data durable.
    fn sync(&mut self) -> io::Result<()>;
}

impl SinkTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

#[derive(Debug)]
struct CsvFile {
    path: PathBuf,
    writer: BufWriter<Box<dyn SinkTarget>>,
    /// Records appended since the last flush.
    pending: usize,
}

/// Destination for records.
///
/// A sink built with [`RecordSink::disabled`] accepts every record and
/// drops it, so monitoring proceeds the same with or without a file.
#[derive(Debug)]
pub struct RecordSink {
    file: Option<CsvFile>,
    path: Option<PathBuf>,
    flush_every: usize,
    records_written: u64,
}

impl RecordSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            file: None,
            path: None,
            flush_every: DEFAULT_FLUSH_EVERY,
            records_written: 0,
        }
    }

    /// Create (or truncate) the file at `path`, creating parent
    /// directories as needed, and write the header row.
    ///
    /// Records are flushed every `flush_every` appends and always on
    /// [`close`](Self::close).
    pub fn open(path: impl AsRef<Path>, flush_every: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| MonitorError::io(parent, e))?;
        }

        let file = File::create(&path).map_err(|e| MonitorError::io(&path, e))?;
        let sink = Self::with_target(path, Box::new(file), flush_every)?;
        if let Some(path) = sink.path() {
            tracing::info!(path = %path.display(), "Initialized CSV dataset file");
        }
        Ok(sink)
    }

    /// Build a sink over an already opened target and write the header.
    pub(crate) fn with_target(
        path: PathBuf,
        target: Box<dyn SinkTarget>,
        flush_every: usize,
    ) -> Result<Self> {
        let mut writer = BufWriter::new(target);
        writeln!(writer, "{}", header_line())
            .and_then(|_| writer.flush())
            .map_err(|e| MonitorError::io(&path, e))?;

        Ok(Self {
            file: Some(CsvFile {
                path: path.clone(),
                writer,
                pending: 0,
            }),
            path: Some(path),
            flush_every: flush_every.max(1),
            records_written: 0,
        })
    }

    /// Append one record. A no-op on a disabled or closed sink.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        writeln!(file.writer, "{}", record.csv_line())?;
        file.pending += 1;

        if file.pending >= self.flush_every {
            file.writer.flush()?;
            file.pending = 0;
        }
        self.records_written += 1;
        Ok(())
    }

    /// Flush buffered records to the file.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.writer.flush()?;
            file.pending = 0;
        }
        Ok(())
    }

    /// Flush and close the file. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.writer
            .flush()
            .and_then(|_| file.writer.get_mut().sync())
            .map_err(|e| MonitorError::io(&file.path, e))?;
        tracing::debug!(path = %file.path.display(), records = self.records_written, "Closed CSV dataset file");
        Ok(())
    }

    /// The file path, if this sink was opened on one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Number of records appended since open.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

impl Drop for RecordSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close CSV dataset file: {}", e);
        }
    }
}
