//! Chunked, pull-driven body transfer.
//!
//! Uploads read from a [`ByteSource`] only when the transport asks for the next chunk;
//! downloads hand at most one chunk at a time to a [`ByteSink`]. Neither side ever holds
//! a whole object in memory.

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Failure, Result};

/// A contiguous slice of an object's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferChunk {
    /// Position of the first byte within the object.
    pub offset: u64,
    /// The data.
    pub bytes: Bytes,
}

impl TransferChunk {
    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the chunk carries no data.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}

/// Sequential producer of upload bytes.
#[async_trait]
pub trait ByteSource: Send {
    /// Reads up to `max` bytes. `Ok(None)` marks the end of the source.
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>>;

    /// Total number of bytes the source will produce, when known.
    fn content_length(&self) -> Option<u64>;

    /// Whether [`rewind`](Self::rewind) can restart the source from offset 0.
    fn is_replayable(&self) -> bool {
        false
    }

    /// Restarts the source from offset 0.
    async fn rewind(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "single-pass source cannot be re-read",
        ))
    }
}

/// A source shared between retry attempts.
pub type SharedSource = Arc<Mutex<Box<dyn ByteSource>>>;

/// Wraps a source so that successive attempts can rewind and re-read it.
pub fn share(source: impl ByteSource + 'static) -> SharedSource {
    Arc::new(Mutex::new(Box::new(source)))
}

/// In-memory, replayable source.
#[derive(Debug, Clone)]
pub struct BufferSource {
    data: Bytes,
    pos: usize,
}

impl BufferSource {
    /// Serves `data` from the start.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

#[async_trait]
impl ByteSource for BufferSource {
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(Some(chunk))
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn is_replayable(&self) -> bool {
        true
    }

    async fn rewind(&mut self) -> io::Result<()> {
        self.pos = 0;
        Ok(())
    }
}

async fn read_up_to<R>(reader: &mut R, max: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(max);
    while buf.len() < max {
        let want = (max - buf.len()) as u64;
        let n = (&mut *reader).take(want).read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok((!buf.is_empty()).then(|| buf.freeze()))
}

/// Seekable file source; replayable.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    /// Opens `path` and records its current size as the content length.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, len })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        read_up_to(&mut self.file, max).await
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.len)
    }

    fn is_replayable(&self) -> bool {
        true
    }

    async fn rewind(&mut self) -> io::Result<()> {
        self.file.rewind().await.map(|_| ())
    }
}

/// Single-pass source over any reader, with a declared length.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    len: u64,
}

impl<R> ReaderSource<R> {
    /// `len` is the number of bytes the reader is expected to yield.
    pub fn new(reader: R, len: u64) -> Self {
        Self { reader, len }
    }
}

#[async_trait]
impl<R> ByteSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        read_up_to(&mut self.reader, max).await
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Turns a source into a lazy sequence of chunks of at most `chunk_size` bytes.
///
/// Nothing is read until the stream is polled. A source that yields fewer or more bytes
/// than its declared length ends the stream with an error.
pub fn upload(
    source: SharedSource,
    chunk_size: usize,
) -> impl Stream<Item = io::Result<TransferChunk>> + Send + 'static {
    let chunk_size = chunk_size.max(1);
    stream::try_unfold((source, 0u64), move |(source, offset)| async move {
        let mut guard = source.lock().await;
        let declared = guard.content_length();
        let next = guard.read_chunk(chunk_size).await?;
        drop(guard);

        match next {
            Some(bytes) if !bytes.is_empty() => {
                let chunk = TransferChunk { offset, bytes };
                if let Some(len) = declared.filter(|len| chunk.end() > *len) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("source produced more than its declared {len} bytes"),
                    ));
                }
                let end = chunk.end();
                Ok(Some((chunk, (source, end))))
            }
            _ => match declared {
                Some(len) if len != offset => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {offset} of {len} declared bytes"),
                )),
                _ => Ok(None),
            },
        }
    })
}

/// Sequential consumer of download bytes.
#[async_trait]
pub trait ByteSink: Send {
    /// Accepts the next chunk. Offsets arrive strictly increasing and gap-free.
    async fn write_chunk(&mut self, chunk: TransferChunk) -> io::Result<()>;

    /// End of stream: every byte was delivered.
    async fn finish(&mut self) -> io::Result<()>;

    /// The transfer stopped early because of `error`.
    async fn fail(&mut self, _error: &Error) {}
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: TransferChunk) -> io::Result<()> {
        self.extend_from_slice(&chunk.bytes);
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes into a file, syncing it to disk on finish.
#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Creates (or truncates) `path`.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path).await?,
        })
    }
}

#[async_trait]
impl ByteSink for FileSink {
    async fn write_chunk(&mut self, chunk: TransferChunk) -> io::Result<()> {
        self.file.write_all(&chunk.bytes).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

/// Writes into any async writer, flushing on finish.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ByteSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: TransferChunk) -> io::Result<()> {
        self.writer.write_all(&chunk.bytes).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}

/// Feeds `body` into `sink` as chunks of at most `chunk_size` bytes.
///
/// On success the sink's [`finish`](ByteSink::finish) is called and the number of bytes
/// delivered is returned. On any failure, including cancellation surfacing from the body
/// and a body that does not match `expected_len`, the sink's [`fail`](ByteSink::fail) is
/// called with the error before it is returned.
pub async fn download<S, K>(
    mut body: S,
    sink: &mut K,
    chunk_size: usize,
    expected_len: Option<u64>,
) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>> + Unpin + Send,
    K: ByteSink + ?Sized,
{
    match pump(&mut body, sink, chunk_size.max(1), expected_len).await {
        Ok(total) => match sink.finish().await {
            Ok(()) => Ok(total),
            Err(err) => {
                let err = Error::Io(err);
                sink.fail(&err).await;
                Err(err)
            }
        },
        Err(err) => {
            sink.fail(&err).await;
            Err(err)
        }
    }
}

struct Delivery<'a, K: ?Sized> {
    sink: &'a mut K,
    offset: u64,
    expected_len: Option<u64>,
}

impl<K: ByteSink + ?Sized> Delivery<'_, K> {
    async fn deliver(&mut self, bytes: Bytes) -> Result<()> {
        let chunk = TransferChunk {
            offset: self.offset,
            bytes,
        };
        if let Some(len) = self.expected_len.filter(|len| chunk.end() > *len) {
            return Err(Error::Terminal(Failure::Malformed(format!(
                "body is longer than its declared {len} bytes"
            ))));
        }
        self.offset = chunk.end();
        self.sink.write_chunk(chunk).await?;
        Ok(())
    }
}

async fn pump<S, K>(
    body: &mut S,
    sink: &mut K,
    chunk_size: usize,
    expected_len: Option<u64>,
) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>> + Unpin + Send,
    K: ByteSink + ?Sized,
{
    let mut out = Delivery {
        sink,
        offset: 0,
        expected_len,
    };
    let mut pending = BytesMut::new();

    while let Some(frame) = body.next().await {
        let mut frame = frame?;
        while !frame.is_empty() {
            if pending.is_empty() && frame.len() >= chunk_size {
                out.deliver(frame.split_to(chunk_size)).await?;
                continue;
            }
            let take = (chunk_size - pending.len()).min(frame.len());
            pending.extend_from_slice(&frame.split_to(take));
            if pending.len() == chunk_size {
                out.deliver(pending.split().freeze()).await?;
            }
        }
    }
    if !pending.is_empty() {
        out.deliver(pending.split().freeze()).await?;
    }

    match expected_len {
        Some(len) if out.offset != len => Err(Error::Retryable(Failure::Network(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body ended after {} of {len} bytes", out.offset),
        )))),
        _ => Ok(out.offset),
    }
}
