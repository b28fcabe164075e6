//! Single-writer, multi-reader durable byte stream
//!
//! A population task writes the entry into a `SharedFile` while any number of waiting
//! requests read it back, each at its own pace. The writer never waits for readers. Readers
//! that catch up with the writer suspend until more bytes land, the file is closed, or the
//! write is aborted.
//!
//! All I/O is positional against one shared descriptor, so readers keep working after the
//! temp file has been renamed into place.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{BodyStream, READ_CHUNK_SIZE};

#[derive(Debug, Clone)]
enum WriteState {
    Writing,
    Complete,
    Failed { kind: io::ErrorKind, message: Arc<str> },
}

#[derive(Debug, Clone)]
struct Progress {
    /// Bytes known to be written
    len: u64,
    state: WriteState,
}

/// Writer side. Owned by exactly one task.
pub struct SharedFile {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
    progress: watch::Sender<Progress>,
    finished: bool,
}

impl SharedFile {
    /// Create `path` for reading and writing. Fails if the file already exists.
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let open_path = path.clone();
        let file = blocking(move || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&open_path)
        })
        .await?;
        Ok(Self::new(file, path))
    }

    pub fn new(file: File, path: PathBuf) -> Self {
        let (progress, _) = watch::channel(Progress {
            len: 0,
            state: WriteState::Writing,
        });
        Self {
            file: Arc::new(file),
            path,
            len: 0,
            progress,
            finished: false,
        }
    }

    /// Path the file was created at (not updated by renames)
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durable length
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes, advancing the durable length once they are written
    pub async fn write(&mut self, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let file = Arc::clone(&self.file);
        let offset = self.len;
        let written = data.len() as u64;
        blocking(move || write_all_at(&file, &data, offset)).await?;

        self.len += written;
        let len = self.len;
        self.progress.send_modify(|progress| progress.len = len);
        Ok(())
    }

    /// Flush written bytes to stable storage
    pub async fn sync(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        blocking(move || file.sync_all()).await
    }

    /// Mark the stream complete; readers see end-of-stream at the durable length
    pub fn close(mut self) {
        self.finish(WriteState::Complete);
    }

    /// Mark the stream failed. Readers get `error` once they pass the last written byte.
    pub fn abort(mut self, error: &(dyn std::error::Error + 'static)) {
        let kind = std::iter::successors(Some(error), |e| e.source())
            .find_map(|e| e.downcast_ref::<io::Error>())
            .map(io::Error::kind)
            .unwrap_or(io::ErrorKind::Other);
        self.finish(WriteState::Failed {
            kind,
            message: error.to_string().into(),
        });
    }

    /// Cheap, cloneable handle for attaching readers
    pub fn handle(&self) -> SharedFileHandle {
        SharedFileHandle {
            file: Arc::clone(&self.file),
            progress: self.progress.subscribe(),
        }
    }

    /// New independent reader positioned at the start
    pub fn spawn_reader(&self) -> SharedFileReader {
        self.handle().spawn_reader()
    }

    fn finish(&mut self, state: WriteState) {
        self.finished = true;
        self.progress.send_modify(|progress| progress.state = state);
    }
}

impl Drop for SharedFile {
    fn drop(&mut self) {
        if !self.finished {
            debug!(path = %self.path.display(), "SharedFile dropped mid-write");
            self.finish(WriteState::Failed {
                kind: io::ErrorKind::BrokenPipe,
                message: "writer dropped before completion".into(),
            });
        }
    }
}

/// Attaches readers to a `SharedFile` without access to the writer
#[derive(Clone)]
pub struct SharedFileHandle {
    file: Arc<File>,
    progress: watch::Receiver<Progress>,
}

impl SharedFileHandle {
    pub fn spawn_reader(&self) -> SharedFileReader {
        SharedFileReader {
            file: Arc::clone(&self.file),
            offset: 0,
            progress: self.progress.clone(),
        }
    }
}

/// Independent read cursor over a `SharedFile`
pub struct SharedFileReader {
    file: Arc<File>,
    offset: u64,
    progress: watch::Receiver<Progress>,
}

impl SharedFileReader {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next chunk of bytes, or `None` at the end of a closed stream
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let progress = self.progress.borrow_and_update().clone();

            if self.offset < progress.len {
                let want = (progress.len - self.offset).min(READ_CHUNK_SIZE as u64) as usize;
                let file = Arc::clone(&self.file);
                let offset = self.offset;
                let chunk = blocking(move || read_at(&file, offset, want)).await?;
                if chunk.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "shared file shorter than its written length",
                    ));
                }
                self.offset += chunk.len() as u64;
                return Ok(Some(chunk));
            }

            match progress.state {
                WriteState::Complete => return Ok(None),
                WriteState::Failed { kind, message } => {
                    return Err(io::Error::new(kind, message.to_string()))
                }
                WriteState::Writing => {
                    if self.progress.changed().await.is_err() {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "shared file writer went away",
                        ));
                    }
                }
            }
        }
    }

    pub fn into_stream(self) -> BodyStream {
        stream::try_unfold(self, |mut reader| async move {
            Ok(reader.read_chunk().await?.map(|chunk| (chunk, reader)))
        })
        .boxed()
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, len: usize) -> io::Result<Bytes> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len];
    let n = file.read_at(&mut buf, offset)?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, len: usize) -> io::Result<Bytes> {
    use std::os::windows::fs::FileExt;
    let mut buf = vec![0u8; len];
    let n = file.seek_read(&mut buf, offset)?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}
