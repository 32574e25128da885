//! Upload payloads and download destinations
//!
//! A [`DataSource`] is opened exactly once per transfer and read in chunks;
//! a [`DataSink`] receives the declared length, then the bytes as they
//! arrive from the wire, then a completion signal. Neither side may assume
//! the whole payload sits in memory.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Reader handed out by [`DataSource::open`]
pub type DataReader = Box<dyn AsyncRead + Send + Unpin>;

/// Producer of an upload payload
#[async_trait]
pub trait DataSource: Send {
    /// Declared payload length, `None` when streaming an unknown amount.
    fn content_length(&self) -> Option<u64>;

    /// Open the payload for reading. Called at most once per transfer.
    async fn open(&mut self) -> io::Result<DataReader>;
}

/// Consumer of a download
#[async_trait]
pub trait DataSink: Send {
    /// Called once before any bytes, with the length announced by the server.
    async fn begin(&mut self, _content_length: Option<u64>) -> io::Result<()> {
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Called once after the last chunk when the transfer succeeded.
    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn content_length(&self) -> Option<u64> {
        (**self).content_length()
    }

    async fn open(&mut self) -> io::Result<DataReader> {
        (**self).open().await
    }
}

#[async_trait]
impl<S: DataSink + ?Sized> DataSink for Box<S> {
    async fn begin(&mut self, content_length: Option<u64>) -> io::Result<()> {
        (**self).begin(content_length).await
    }

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        (**self).write(chunk).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        (**self).finish().await
    }
}

/// In-memory payload
#[derive(Debug, Clone, Default)]
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Zero-length payload, for creating empty files.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataSource for BytesSource {
    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn open(&mut self) -> io::Result<DataReader> {
        Ok(Box::new(io::Cursor::new(self.data.clone())))
    }
}

/// Local file payload
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    length: u64,
}

impl FileSource {
    /// Stat the file now; the length is what gets declared to the server.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        Ok(Self {
            path,
            length: meta.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }

    async fn open(&mut self) -> io::Result<DataReader> {
        let file = fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

/// Payload pulled from an arbitrary reader, readable once
pub struct ReaderSource<R> {
    reader: Option<R>,
    length: Option<u64>,
}

impl<R> ReaderSource<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub fn new(reader: R, length: Option<u64>) -> Self {
        Self {
            reader: Some(reader),
            length,
        }
    }
}

#[async_trait]
impl<R> DataSource for ReaderSource<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    fn content_length(&self) -> Option<u64> {
        self.length
    }

    async fn open(&mut self) -> io::Result<DataReader> {
        match self.reader.take() {
            Some(reader) => Ok(Box::new(reader)),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "reader source already consumed",
            )),
        }
    }
}

/// Writes the download to a local file.
///
/// The file is created on `begin`. If the sink is dropped before `finish`
/// (error, cancellation) the partial file is removed.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<fs::File>,
    created: bool,
    completed: bool,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            created: false,
            completed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataSink for FileSink {
    async fn begin(&mut self, _content_length: Option<u64>) -> io::Result<()> {
        let file = fs::File::create(&self.path).await?;
        self.file = Some(file);
        self.created = true;
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await,
            None => Err(io::Error::new(io::ErrorKind::Other, "sink not started")),
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        self.completed = true;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        drop(self.file.take());
        if self.created && !self.completed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!("could not remove partial download {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Collects the download in memory. Clones share the same buffer, so keep
/// one handle and move the other into the call.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

/// Upper bound for up-front reservation.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer.lock())
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn begin(&mut self, content_length: Option<u64>) -> io::Result<()> {
        let mut buffer = self.buffer.lock();
        buffer.clear();
        if let Some(len) = content_length {
            buffer.reserve(len.min(MAX_PREALLOCATION) as usize);
        }
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.buffer.lock().extend_from_slice(chunk);
        Ok(())
    }
}

/// Adapts any [`AsyncWrite`] into a sink.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> DataSink for WriterSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}
