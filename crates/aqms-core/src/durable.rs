//! `std::fs` implementation of [`DurableFile`]

use crate::error::{TelemetryError, TelemetryResult};
use crate::traits::{DurableFile, LineWriter, Lines, RawLine};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Durable line storage on a local filesystem
#[derive(Debug, Clone)]
pub struct FsDurableFile {
    /// Create missing parent directories on write
    create_dirs: bool,
}

impl FsDurableFile {
    pub fn new() -> Self {
        Self { create_dirs: true }
    }

    /// Fail instead of creating missing parent directories
    pub fn without_dir_creation() -> Self {
        Self { create_dirs: false }
    }

    fn ensure_parent(&self, path: &Path) -> TelemetryResult<()> {
        if !self.create_dirs {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| TelemetryError::storage(parent, e))?;
            }
        }
        Ok(())
    }
}

impl Default for FsDurableFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a non-empty file is missing its final newline
fn has_torn_tail(file: &mut File) -> std::io::Result<bool> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(unix)]
fn sync_dir(path: &Path) {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Failed to sync directory {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) {}

impl DurableFile for FsDurableFile {
    fn append_raw(&self, path: &Path, bytes: &[u8]) -> TelemetryResult<()> {
        self.ensure_parent(path)?;
        let storage = |e: std::io::Error| TelemetryError::storage(path, e);

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(storage)?;

        // A crash mid-append can leave a fragment without its newline.
        // Terminate it so the new entry starts on a line of its own.
        let mut buf = Vec::with_capacity(bytes.len() + 2);
        if has_torn_tail(&mut file).map_err(storage)? {
            warn!("Torn tail detected in {}, terminating fragment", path.display());
            buf.push(b'\n');
        }
        buf.extend_from_slice(bytes);
        buf.push(b'\n');

        file.write_all(&buf).map_err(storage)?;
        file.sync_data().map_err(storage)?;
        Ok(())
    }

    fn read_lines(&self, path: &Path) -> TelemetryResult<Lines<'_>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} does not exist, nothing to read", path.display());
                return Ok(Box::new(std::iter::empty()));
            }
            Err(e) => return Err(TelemetryError::storage(path, e)),
        };

        Ok(Box::new(RawLines {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            line_no: 0,
            done: false,
        }))
    }

    fn create(&self, path: &Path) -> TelemetryResult<Box<dyn LineWriter + '_>> {
        self.ensure_parent(path)?;
        let file = File::create(path).map_err(|e| TelemetryError::storage(path, e))?;
        Ok(Box::new(FsLineWriter {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        }))
    }

    fn atomic_replace(&self, path: &Path, replacement: &Path) -> TelemetryResult<()> {
        std::fs::rename(replacement, path).map_err(|e| TelemetryError::storage(path, e))?;
        sync_dir(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> TelemetryResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TelemetryError::storage(path, e)),
        }
    }
}

/// Line iterator that keeps each line's bytes as stored
struct RawLines {
    reader: BufReader<File>,
    path: PathBuf,
    line_no: usize,
    done: bool,
}

impl Iterator for RawLines {
    type Item = TelemetryResult<RawLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut bytes = Vec::new();
        match self.reader.read_until(b'\n', &mut bytes) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                self.line_no += 1;
                let terminated = bytes.last() == Some(&b'\n');
                if terminated {
                    bytes.pop();
                } else {
                    // Only the final line can lack a newline: a torn append.
                    self.done = true;
                }
                Some(Ok(RawLine {
                    line_no: self.line_no,
                    bytes,
                    terminated,
                }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(TelemetryError::storage(&self.path, e)))
            }
        }
    }
}

struct FsLineWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LineWriter for FsLineWriter {
    fn write_raw(&mut self, bytes: &[u8]) -> TelemetryResult<()> {
        self.writer
            .write_all(bytes)
            .and_then(|()| self.writer.write_all(b"\n"))
            .map_err(|e| TelemetryError::storage(&self.path, e))
    }

    fn finish(self: Box<Self>) -> TelemetryResult<()> {
        let FsLineWriter { writer, path } = *self;
        let file = writer
            .into_inner()
            .map_err(|e| TelemetryError::storage(&path, e.into_error()))?;
        file.sync_all().map_err(|e| TelemetryError::storage(&path, e))
    }
}
