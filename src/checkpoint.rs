//! Checkpoint archives: a gzip stream of `(name, data)` file records.
//!
//! A server streams its engine checkpoint directory through [`ArchiveWriter`];
//! a new replica replays the stream into an empty directory with [`bootstrap`]
//! before opening its own engine there.

use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use axum::body::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::store::StoreError;

/// One file of a checkpoint, named relative to the checkpoint root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub name: String,
    pub data: Vec<u8>,
}

pub struct ArchiveWriter<W: Write> {
    gz: GzEncoder<W>,
    files: usize,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            gz: GzEncoder::new(sink, Compression::default()),
            files: 0,
        }
    }

    pub fn add(&mut self, file: &CheckpointFile) -> Result<(), StoreError> {
        bincode::serialize_into(&mut self.gz, file)?;
        self.files += 1;
        Ok(())
    }

    /// Add every regular file under `root`, recursively.
    pub fn add_dir(&mut self, root: &Path) -> Result<(), StoreError> {
        let mut paths = Vec::new();
        collect_files(root, &mut paths)?;
        paths.sort();
        for path in paths {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let data = fs::read(&path)?;
            self.add(&CheckpointFile { name, data })?;
        }
        Ok(())
    }

    /// Flush the compressor and return the number of files written.
    pub fn finish(self) -> Result<usize, StoreError> {
        self.gz.finish()?;
        Ok(self.files)
    }
}

/// Blocking `Write` that hands each chunk to an async consumer, such as a
/// streamed response body. Writing fails once the receiver is gone.
pub struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self { tx }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "checkpoint receiver closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Decode an archive and write each file under `dest`. Returns the file count.
pub fn unpack(reader: impl Read, dest: &Path) -> Result<usize, StoreError> {
    let mut input = BufReader::new(GzDecoder::new(reader));
    let mut count = 0;
    loop {
        if input.fill_buf()?.is_empty() {
            break;
        }
        let file: CheckpointFile = bincode::deserialize_from(&mut input)?;
        let path = dest.join(relative_path(&file.name)?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &file.data)?;
        tracing::info!(name = %file.name, bytes = file.data.len(), "Downloaded checkpoint file");
        count += 1;
    }
    Ok(count)
}

// Security: entries must stay inside the destination.
fn relative_path(name: &str) -> Result<PathBuf, StoreError> {
    let path = Path::new(name);
    let safe = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(StoreError::UnsafePath(name.to_string()))
    }
}

/// Replay a checkpoint archive into `dir`, which must be empty or absent.
///
/// Files are staged in a sibling directory and moved into place only once the
/// whole stream has decoded, so a failed transfer leaves `dir` as it was.
pub fn bootstrap(reader: impl Read, dir: &Path) -> Result<usize, StoreError> {
    if dir.exists() && fs::read_dir(dir)?.next().is_some() {
        return Err(StoreError::TargetNotEmpty(dir.to_path_buf()));
    }

    let parent = dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".bootstrap-")
        .tempdir_in(parent)?;

    let count = unpack(reader, staging.path())?;

    let staged = staging.keep();
    if dir.exists() {
        fs::remove_dir(dir)?;
    }
    if let Err(e) = fs::rename(&staged, dir) {
        let _ = fs::remove_dir_all(&staged);
        return Err(e.into());
    }
    Ok(count)
}
