use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderName};
use tracing::{debug, info, instrument};

use crate::config::{Config, DEFAULT_REGION};
use crate::context::CallContext;
use crate::credentials::{CredentialCache, Credentials};
use crate::error::{Error, Failure, Result};
use crate::request::signing::{HmacSha256Signer, Signer};
use crate::request::{Body, Operation, OperationKind, RequestBuilder};
use crate::retry::Replay;
use crate::transfer::{self, ByteSink, ByteSource, FileSink, FileSource, SharedSource};
use crate::transport::connector::{Connector, HttpConnector};
use crate::transport::pool::ConnectionPool;
use crate::transport::{Executor, Response, ResponseBody};
use crate::{ObjectInfo, xml};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const LIST_BODY_LIMIT: usize = 16 * 1024 * 1024;
const META_PREFIX: &str = "x-amz-meta-";

/// Result of [`ObjectStorage::make_bucket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketCreation {
    /// The bucket was created by this call.
    Created,
    /// The bucket already existed and belongs to the caller.
    AlreadyOwned,
}

/// Options for uploads.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// `content-type` of the object. Defaults to `application/octet-stream`.
    pub content_type: Option<String>,
    /// User metadata, sent as `x-amz-meta-*` headers.
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    /// Options with the given content type.
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }
}

/// What the service reported about a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInfo {
    /// Bucket the object was written to.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Entity tag without quotes.
    pub etag: Option<String>,
    /// Bytes uploaded.
    pub size: u64,
}

/// Options for [`ObjectStorage::list_objects`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// List every key below the prefix. Otherwise one level is listed and deeper keys are
    /// rolled up into prefix entries.
    pub recursive: bool,
    /// Page size requested from the service, 1 to 1000.
    pub max_keys: Option<u32>,
}

#[derive(Clone)]
enum Payload {
    Empty,
    Buffer(Bytes),
    Source {
        source: SharedSource,
        len: u64,
        replayable: bool,
    },
}

impl Payload {
    fn is_replayable(&self) -> bool {
        match self {
            Payload::Empty | Payload::Buffer(_) => true,
            Payload::Source { replayable, .. } => *replayable,
        }
    }

    fn len(&self) -> u64 {
        match self {
            Payload::Empty => 0,
            Payload::Buffer(bytes) => bytes.len() as u64,
            Payload::Source { len, .. } => *len,
        }
    }

    /// The body of attempt number `attempt`, rewinding the source for retries.
    async fn body_for_attempt(&self, attempt: u32, chunk_size: usize) -> Result<Body> {
        match self {
            Payload::Empty => Ok(Body::Empty),
            Payload::Buffer(bytes) => Ok(Body::Buffer(bytes.clone())),
            Payload::Source { source, len, .. } => {
                if attempt > 1 {
                    source.lock().await.rewind().await?;
                }
                if *len == 0 {
                    return Ok(Body::Empty);
                }
                let chunks = transfer::upload(source.clone(), chunk_size)
                    .map_ok(|chunk| chunk.bytes)
                    .boxed();
                Ok(Body::Stream { len: *len, chunks })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Read {
    Discard,
    Collect(usize),
}

struct Inner {
    config: Config,
    builder: RequestBuilder,
    credentials: CredentialCache,
    executor: Executor,
}

/// Client for an S3-compatible object storage service.
///
/// Cheap to clone; clones share the connection pool and the credentials.
#[derive(Clone)]
pub struct ObjectStorage {
    inner: Arc<Inner>,
}

impl fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("endpoint", &self.inner.config.endpoint.authority())
            .field("secure", &self.inner.config.endpoint.secure)
            .field("pool", self.inner.executor.pool())
            .finish()
    }
}

impl ObjectStorage {
    /// Creates a client that talks HTTP(S) to the configured endpoint.
    #[instrument(skip(config), fields(endpoint = %config.endpoint.authority()))]
    pub fn new(config: Config) -> Result<Self> {
        let connector = HttpConnector::for_endpoint(&config.endpoint)?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Creates a client on top of a custom network collaborator.
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::with_parts(config, connector, Arc::new(HmacSha256Signer))
    }

    /// Creates a client with custom network and signing collaborators.
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn Connector>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(
            connector,
            config.endpoint.clone(),
            config.max_connections,
            config.idle_timeout,
        );
        let inner = Inner {
            builder: RequestBuilder::new(config.endpoint.clone(), signer),
            credentials: CredentialCache::new(config.credentials.clone()),
            executor: Executor::new(pool, config.attempt_timeout),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        self.inner.executor.pool()
    }

    /// Replaces the credentials used by requests signed from now on.
    pub fn rotate_credentials(&self, credentials: Credentials) {
        self.inner.credentials.rotate(credentials);
    }

    /// Creates `bucket`. A bucket the caller already owns counts as success.
    #[instrument(skip(self, ctx))]
    pub async fn make_bucket(&self, bucket: &str, ctx: &CallContext) -> Result<BucketCreation> {
        let mut op = Operation::bucket(OperationKind::CreateBucket, bucket);
        let region = self.inner.config.endpoint.region.as_str();
        let payload = if region != DEFAULT_REGION {
            op = op.with_header(header::CONTENT_TYPE, "application/xml")?;
            Payload::Buffer(Bytes::from(xml::create_bucket_configuration(region)?))
        } else {
            Payload::Empty
        };

        match self.exchange(&op, payload, Read::Discard, ctx).await {
            Ok(_) => {
                info!("bucket created");
                Ok(BucketCreation::Created)
            }
            Err(err) if err.is_already_owned() => {
                info!("bucket already owned");
                Ok(BucketCreation::AlreadyOwned)
            }
            Err(err) => Err(err),
        }
    }

    /// Whether `bucket` exists and is accessible.
    #[instrument(skip(self, ctx))]
    pub async fn bucket_exists(&self, bucket: &str, ctx: &CallContext) -> Result<bool> {
        let op = Operation::bucket(OperationKind::HeadBucket, bucket);
        match self.exchange(&op, Payload::Empty, Read::Discard, ctx).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Deletes an empty bucket.
    #[instrument(skip(self, ctx))]
    pub async fn remove_bucket(&self, bucket: &str, ctx: &CallContext) -> Result<()> {
        let op = Operation::bucket(OperationKind::DeleteBucket, bucket);
        self.exchange(&op, Payload::Empty, Read::Discard, ctx).await?;
        info!("bucket removed");
        Ok(())
    }

    /// Streams `source` into `bucket/key`.
    ///
    /// The source must declare its length. Replayable sources are rewound and resent when an
    /// attempt fails; single-pass sources get exactly one attempt.
    #[instrument(skip(self, source, options, ctx))]
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: impl ByteSource + 'static,
        options: PutOptions,
        ctx: &CallContext,
    ) -> Result<UploadInfo> {
        let len = source.content_length().ok_or_else(|| {
            Error::InvalidArgument("uploads must declare their content length".into())
        })?;
        let replayable = source.is_replayable();
        let payload = Payload::Source {
            source: transfer::share(source),
            len,
            replayable,
        };
        self.upload(bucket, key, payload, options, ctx).await
    }

    /// Uploads an in-memory buffer. The payload is hashed and signed.
    #[instrument(skip(self, data, options, ctx))]
    pub async fn put_bytes(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        options: PutOptions,
        ctx: &CallContext,
    ) -> Result<UploadInfo> {
        let data = data.into();
        let payload = if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Buffer(data)
        };
        self.upload(bucket, key, payload, options, ctx).await
    }

    /// Uploads the file at `path`.
    #[instrument(skip(self, path, options, ctx), fields(path = %path.as_ref().display()))]
    pub async fn fput_object(
        &self,
        bucket: &str,
        key: &str,
        path: impl AsRef<Path>,
        options: PutOptions,
        ctx: &CallContext,
    ) -> Result<UploadInfo> {
        let source = FileSource::open(path.as_ref()).await?;
        self.put_object(bucket, key, source, options, ctx).await
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        payload: Payload,
        options: PutOptions,
        ctx: &CallContext,
    ) -> Result<UploadInfo> {
        let content_type = options.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        let mut op = Operation::object(OperationKind::PutObject, bucket, key)
            .with_header(header::CONTENT_TYPE, content_type)?;
        for (name, value) in &options.metadata {
            let name = HeaderName::from_bytes(format!("{META_PREFIX}{name}").as_bytes())
                .map_err(|_| Error::InvalidArgument(format!("invalid metadata name {name:?}")))?;
            op = op.with_header(name, value)?;
        }

        let size = payload.len();
        let (headers, _) = self.exchange(&op, payload, Read::Discard, ctx).await?;
        debug!(size, "object uploaded");
        Ok(UploadInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: etag(&headers),
            size,
        })
    }

    /// Downloads `bucket/key` into `sink`.
    ///
    /// The sink sees [`ByteSink::finish`] after the last byte, or [`ByteSink::fail`] when the
    /// transfer stops early. Only the request up to the response head is retried.
    #[instrument(skip(self, sink, ctx))]
    pub async fn get_object<K>(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut K,
        ctx: &CallContext,
    ) -> Result<ObjectInfo>
    where
        K: ByteSink + ?Sized,
    {
        let op = Operation::object(OperationKind::GetObject, bucket, key);
        let response = match self.send(&op, Payload::Empty, ctx).await {
            Ok(response) => response,
            Err(err) => {
                sink.fail(&err).await;
                return Err(err);
            }
        };
        let expected = response.content_length();
        let mut info = object_info(key, &response.headers);
        let size = transfer::download(
            response.body.into_stream(),
            sink,
            self.inner.config.chunk_size,
            expected,
        )
        .await?;
        info.size = size;
        debug!(size, "object downloaded");
        Ok(info)
    }

    /// Opens `bucket/key` for incremental reading.
    #[instrument(skip(self, ctx))]
    pub async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
        ctx: &CallContext,
    ) -> Result<ObjectReader> {
        let op = Operation::object(OperationKind::GetObject, bucket, key);
        let response = self.send(&op, Payload::Empty, ctx).await?;
        let expected = response.content_length();
        Ok(ObjectReader {
            info: object_info(key, &response.headers),
            body: response.body,
            pending: Bytes::new(),
            received: 0,
            expected,
        })
    }

    /// Downloads `bucket/key` to the file at `path`.
    ///
    /// Data lands in `<path>.part` first and is renamed into place once complete, so a failed
    /// download never leaves a truncated file at `path`.
    #[instrument(skip(self, path, ctx), fields(path = %path.as_ref().display()))]
    pub async fn fget_object(
        &self,
        bucket: &str,
        key: &str,
        path: impl AsRef<Path>,
        ctx: &CallContext,
    ) -> Result<ObjectInfo> {
        let path = path.as_ref();
        let part = part_path(path);
        let mut sink = FileSink::create(&part).await?;

        match self.get_object(bucket, key, &mut sink, ctx).await {
            Ok(info) => {
                drop(sink);
                tokio::fs::rename(&part, path).await?;
                Ok(info)
            }
            Err(err) => {
                drop(sink);
                if let Err(cleanup) = tokio::fs::remove_file(&part).await {
                    debug!(
                        error = %cleanup,
                        part = %part.display(),
                        "could not remove partial file"
                    );
                }
                Err(err)
            }
        }
    }

    /// Metadata of `bucket/key`.
    #[instrument(skip(self, ctx))]
    pub async fn stat_object(
        &self,
        bucket: &str,
        key: &str,
        ctx: &CallContext,
    ) -> Result<ObjectInfo> {
        let op = Operation::object(OperationKind::HeadObject, bucket, key);
        let (headers, _) = self.exchange(&op, Payload::Empty, Read::Discard, ctx).await?;
        Ok(object_info(key, &headers))
    }

    /// Lists the objects of `bucket`, fetching pages as the stream is polled.
    ///
    /// Entries come in the order the service returns them. The stream ends after the first
    /// error; listing again starts from the beginning.
    pub fn list_objects(
        &self,
        bucket: &str,
        options: ListOptions,
        ctx: &CallContext,
    ) -> BoxStream<'static, Result<ObjectInfo>> {
        let state = Listing {
            client: self.clone(),
            bucket: bucket.to_string(),
            options,
            ctx: ctx.clone(),
            page: VecDeque::new(),
            token: None,
            done: false,
        };
        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(entry) = state.page.pop_front() {
                    return Ok(Some((entry, state)));
                }
                if state.done {
                    return Ok(None);
                }
                state.fetch_page().await?;
            }
        })
        .boxed()
    }

    /// Deletes `bucket/key`. Deleting a missing key succeeds.
    #[instrument(skip(self, ctx))]
    pub async fn remove_object(&self, bucket: &str, key: &str, ctx: &CallContext) -> Result<()> {
        let op = Operation::object(OperationKind::DeleteObject, bucket, key);
        self.exchange(&op, Payload::Empty, Read::Discard, ctx).await?;
        debug!("object removed");
        Ok(())
    }

    async fn attempt(
        &self,
        op: &Operation,
        payload: &Payload,
        attempt: u32,
        ctx: &CallContext,
    ) -> Result<Response> {
        let body = payload
            .body_for_attempt(attempt, self.inner.config.chunk_size)
            .await?;
        let credentials = self.inner.credentials.snapshot();
        let request = self.inner.builder.build(op, &credentials, body, Utc::now())?;
        self.inner.executor.execute(request, ctx).await
    }

    /// Retries up to the response head and hands back the unread body.
    async fn send(&self, op: &Operation, payload: Payload, ctx: &CallContext) -> Result<Response> {
        op.validate()?;
        let replay = Replay::for_request(&op.kind.method(), payload.is_replayable());
        let payload = &payload;
        self.inner
            .config
            .retry
            .run(ctx, replay, |attempt| self.attempt(op, payload, attempt, ctx))
            .await
    }

    /// Retries the whole exchange, body included. For responses small enough to buffer.
    async fn exchange(
        &self,
        op: &Operation,
        payload: Payload,
        read: Read,
        ctx: &CallContext,
    ) -> Result<(HeaderMap, Bytes)> {
        op.validate()?;
        let replay = Replay::for_request(&op.kind.method(), payload.is_replayable());
        let payload = &payload;
        self.inner
            .config
            .retry
            .run(ctx, replay, |attempt| async move {
                let Response { headers, body, .. } = self.attempt(op, payload, attempt, ctx).await?;
                let bytes = match read {
                    Read::Discard => {
                        body.drain().await?;
                        Bytes::new()
                    }
                    Read::Collect(limit) => body.bytes(limit).await?,
                };
                Ok((headers, bytes))
            })
            .await
    }
}

struct Listing {
    client: ObjectStorage,
    bucket: String,
    options: ListOptions,
    ctx: CallContext,
    page: VecDeque<ObjectInfo>,
    token: Option<String>,
    done: bool,
}

impl Listing {
    async fn fetch_page(&mut self) -> Result<()> {
        let mut op = Operation::bucket(OperationKind::ListObjects, self.bucket.as_str())
            .with_query("list-type", "2");
        if let Some(prefix) = self.options.prefix.as_deref().filter(|p| !p.is_empty()) {
            op = op.with_query("prefix", prefix);
        }
        if !self.options.recursive {
            op = op.with_query("delimiter", "/");
        }
        if let Some(max_keys) = self.options.max_keys {
            if !(1..=1000).contains(&max_keys) {
                return Err(Error::InvalidArgument(format!(
                    "max_keys must be between 1 and 1000, got {max_keys}"
                )));
            }
            op = op.with_query("max-keys", max_keys.to_string());
        }
        if let Some(token) = &self.token {
            op = op.with_query("continuation-token", token.as_str());
        }

        let (_, body) = self
            .client
            .exchange(&op, Payload::Empty, Read::Collect(LIST_BODY_LIMIT), &self.ctx)
            .await?;
        let page = xml::parse_list(&body)?;
        debug!(
            bucket = %self.bucket,
            objects = page.contents.len(),
            prefixes = page.common_prefixes.len(),
            truncated = page.is_truncated,
            "listing page"
        );

        self.page.extend(page.contents.into_iter().map(|entry| ObjectInfo {
            key: entry.key,
            size: entry.size,
            last_modified: entry.last_modified,
            etag: entry.e_tag.map(|tag| tag.trim_matches('"').to_string()),
            content_type: None,
            metadata: BTreeMap::new(),
            is_prefix: false,
        }));
        self.page.extend(page.common_prefixes.into_iter().map(|p| ObjectInfo {
            key: p.prefix,
            is_prefix: true,
            ..ObjectInfo::default()
        }));

        match (page.is_truncated, page.next_continuation_token) {
            (true, Some(token)) => self.token = Some(token),
            (true, None) => {
                return Err(Error::Terminal(Failure::Malformed(
                    "truncated listing without a continuation token".into(),
                )));
            }
            (false, _) => self.done = true,
        }
        Ok(())
    }
}

/// An object being read incrementally.
///
/// Holds a pooled connection until the body is read to its end; dropping the reader early
/// closes that connection.
#[derive(Debug)]
pub struct ObjectReader {
    info: ObjectInfo,
    body: ResponseBody,
    pending: Bytes,
    received: u64,
    expected: Option<u64>,
}

impl ObjectReader {
    /// Metadata from the response headers.
    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// Next piece of the object, or `None` once every byte was read.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        match self.body.next_chunk().await? {
            Some(bytes) => {
                self.received += bytes.len() as u64;
                if let Some(expected) = self.expected.filter(|len| self.received > *len) {
                    return Err(Error::Terminal(Failure::Malformed(format!(
                        "body is longer than its declared {expected} bytes"
                    ))));
                }
                Ok(Some(bytes))
            }
            None => match self.expected {
                Some(expected) if expected != self.received => {
                    Err(Error::Retryable(Failure::Network(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("body ended after {} of {expected} bytes", self.received),
                    ))))
                }
                _ => Ok(None),
            },
        }
    }

    /// Reads up to `buf.len()` bytes; `Ok(0)` marks the end of the object.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.next_chunk().await? {
                Some(bytes) => self.pending = bytes,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    /// The remaining bytes as a stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_chunk().await?.map(|bytes| (bytes, reader)))
        })
        .boxed()
    }

    /// Reads the rest of the object into memory.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(bytes) = self.next_chunk().await? {
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: impl http::header::AsHeaderName,
) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn etag(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::ETAG).map(|tag| tag.trim_matches('"').to_string())
}

fn object_info(key: &str, headers: &HeaderMap) -> ObjectInfo {
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix(META_PREFIX)?;
            Some((name.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    ObjectInfo {
        key: key.to_string(),
        size: header_str(headers, header::CONTENT_LENGTH)
            .and_then(|len| len.parse().ok())
            .unwrap_or(0),
        last_modified: header_str(headers, header::LAST_MODIFIED)
            .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
            .map(|date| date.with_timezone(&Utc)),
        etag: etag(headers),
        content_type: header_str(headers, header::CONTENT_TYPE).map(str::to_string),
        metadata,
        is_prefix: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn object_info_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("19"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"abc123\""));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        headers.insert("x-amz-meta-owner", HeaderValue::from_static("walkthrough"));

        let info = object_info("test-file.txt", &headers);
        assert_eq!(info.key, "test-file.txt");
        assert_eq!(info.size, 19);
        assert_eq!(info.etag.as_deref(), Some("abc123"));
        assert_eq!(info.content_type.as_deref(), Some("text/plain"));
        assert_eq!(info.metadata.get("owner").map(String::as_str), Some("walkthrough"));
        assert_eq!(
            info.last_modified.map(|d| d.to_rfc3339()),
            Some("2015-10-21T07:28:00+00:00".to_string())
        );
    }

    #[test]
    fn partial_downloads_get_a_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/downloaded-test-file.txt")),
            PathBuf::from("/tmp/downloaded-test-file.txt.part")
        );
    }
}
