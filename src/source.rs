//! Read state for one tailed log file.

use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Notification that a source needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    /// New data may be available.
    Changed,
    /// The file was rotated or truncated; start over from the beginning.
    Rotated,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no source is registered for {}", .0.display())]
    Unknown(PathBuf),
    #[error("source {} is shutting down", .0.display())]
    Closed(PathBuf),
}

/// One complete line and the file offset just past its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub end: u64,
}

/// Largest chunk read from a file in one go.
const READ_CHUNK: u64 = 1 << 20;

/// Offset, identity and partial-line buffer of a tailed file. Owned by
/// exactly one dispatcher task.
#[derive(Debug)]
pub struct LogSource {
    path: PathBuf,
    name: String,
    /// Offset just past the last line handed out and processed.
    offset: u64,
    /// Offset up to which bytes have been read into `partial`.
    read_pos: u64,
    identity: Option<u64>,
    /// Bytes of an unterminated trailing line.
    partial: Vec<u8>,
}

impl LogSource {
    /// Open a source. Without `from_start`, reading begins at the current
    /// end of the file, so only lines written afterwards are seen. A missing
    /// file is read from the beginning once it appears.
    pub async fn open(path: impl Into<PathBuf>, from_start: bool) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        let (offset, identity) = match tokio::fs::metadata(&path).await {
            Ok(meta) => (if from_start { 0 } else { meta.len() }, file_identity(&meta)),
            Err(_) => (0, None),
        };
        Self {
            path,
            name,
            offset,
            read_pos: offset,
            identity,
            partial: Vec::new(),
        }
    }

    /// The path as shown to programs by `getfilename()`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Forget all read state and start again at offset zero.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.read_pos = 0;
        self.partial.clear();
    }

    /// Record that every line up to `end` has been processed.
    pub fn commit(&mut self, end: u64) {
        self.offset = self.offset.max(end);
    }

    /// Read the next chunk appended since the last call and return the
    /// complete lines in it. Call again until it returns no lines to drain
    /// the file; an empty result means nothing complete is left. A trailing
    /// partial line is held back until its newline arrives. Rotation (a new
    /// file at the same path) and truncation (the file shrank below the read
    /// position) reset the source first.
    pub async fn read_lines(&mut self) -> Result<Vec<Line>, SourceError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            // Between rotation steps the path may briefly not exist.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let identity = file_identity(&meta);
        if identity.is_some() && self.identity.is_some() && identity != self.identity {
            tracing::info!(source = %self.name, "file rotated, reading new file from the start");
            self.reset();
        } else if meta.len() < self.read_pos {
            tracing::info!(source = %self.name, len = meta.len(), offset = self.read_pos, "file truncated, resetting");
            self.reset();
        }
        self.identity = identity.or(self.identity);

        if meta.len() == self.read_pos {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await.map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(self.read_pos)).await.map_err(|e| self.io_error(e))?;

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = (&mut file)
                .take(READ_CHUNK)
                .read_to_end(&mut buf)
                .await
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                break;
            }
            self.read_pos += n as u64;
            self.split_lines(&buf, &mut lines);
            // Keep going only while a line is longer than one chunk.
            if !lines.is_empty() || (n as u64) < READ_CHUNK {
                break;
            }
        }
        Ok(lines)
    }

    /// Append `bytes` to the partial buffer and move every complete line into `out`.
    fn split_lines(&mut self, bytes: &[u8], out: &mut Vec<Line>) {
        // Offset of the first byte held in `partial`.
        let mut line_start = self.read_pos - bytes.len() as u64 - self.partial.len() as u64;
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            self.partial.extend_from_slice(head);
            let consumed = self.partial.len() as u64 + 1;
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
            out.push(Line {
                text: String::from_utf8_lossy(&self.partial).into_owned(),
                end: line_start + consumed,
            });
            line_start += consumed;
            self.partial.clear();
            rest = tail.get(1..).unwrap_or_default();
        }
        self.partial.extend_from_slice(rest);
    }

    fn io_error(&self, source: std::io::Error) -> SourceError {
        SourceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}
