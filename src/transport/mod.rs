//! One physical attempt: pooled connection, request write, classified response.

pub mod connector;
pub mod pool;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use http::{HeaderMap, HeaderName, StatusCode, header};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::context::CallContext;
use crate::error::{Error, Failure, Result};
use crate::request::{Body, Request};
use crate::xml;

use self::connector::IncomingBody;
use self::pool::{ConnectionPool, PooledConnection};

/// Error bodies larger than this are cut off and their connection is not reused.
pub const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Classification of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The service accepted the request.
    Success,
    /// Another attempt may succeed.
    RetryableError,
    /// Another attempt would fail the same way.
    TerminalError,
    /// The call context ended the attempt.
    Cancelled,
}

/// Classifies a response status.
pub fn classify_status(status: StatusCode) -> Outcome {
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        Outcome::Success
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Outcome::RetryableError
    } else {
        Outcome::TerminalError
    }
}

/// Runs single attempts over a connection pool.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: ConnectionPool,
    attempt_timeout: Duration,
}

impl Executor {
    /// An executor whose attempts may spend at most `attempt_timeout` obtaining a
    /// connection, and at most as long again without the request making progress.
    pub fn new(pool: ConnectionPool, attempt_timeout: Duration) -> Self {
        Self {
            pool,
            attempt_timeout,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Sends `request` once.
    ///
    /// Successful responses hand back their body still attached to the connection. Error
    /// responses are read (up to [`ERROR_BODY_LIMIT`]) and turned into a
    /// [`ServiceError`](crate::ServiceError) classified by status.
    pub async fn execute(&self, request: Request, ctx: &CallContext) -> Result<Response> {
        if ctx.is_done() {
            return Err(Error::Cancelled);
        }
        let method = request.method.clone();
        let target = request.target();

        let (conn, response) = tokio::select! {
            biased;
            _ = ctx.done() => return Err(Error::Cancelled),
            head = self.send_head(request) => head?,
        };

        let (parts, body) = response.into_parts();
        let status = parts.status;
        debug!(
            %method,
            %target,
            status = status.as_u16(),
            reused = conn.is_reused(),
            "response head"
        );
        let body = ResponseBody {
            inner: Some(body),
            conn: Some(conn),
            ctx: ctx.clone(),
        };

        let outcome = classify_status(status);
        if outcome == Outcome::Success {
            return Ok(Response {
                status,
                headers: parts.headers,
                body,
            });
        }

        let raw = match body.bytes(ERROR_BODY_LIMIT).await {
            Ok(raw) => raw,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                debug!(error = %err, "error body unreadable");
                Bytes::new()
            }
        };
        let service = xml::parse_error(status.as_u16(), &raw);
        Err(match outcome {
            Outcome::RetryableError => Error::Retryable(Failure::Service(service)),
            _ => Error::Terminal(Failure::Service(service)),
        })
    }

    /// Checks out a connection, writes the request and waits for the response head.
    ///
    /// The attempt timeout bounds checkout and connect, then every gap between body chunks
    /// and the wait for the head once the body is written. The total upload time is left
    /// to the call context.
    async fn send_head(
        &self,
        mut request: Request,
    ) -> Result<(PooledConnection, http::Response<IncomingBody>)> {
        let checkout = tokio::time::timeout(self.attempt_timeout, self.pool.checkout());
        let mut conn = match checkout.await {
            Ok(conn) => conn.map_err(Error::from_transport)?,
            Err(_) => return Err(Error::Retryable(Failure::Timeout)),
        };

        let watch = BodyWatch::new();
        request.body = watch.observe(request.body);
        let sent = {
            let mut send = std::pin::pin!(conn.send(request.into_http()?));
            loop {
                tokio::select! {
                    sent = &mut send => break sent,
                    _ = tokio::time::sleep_until(watch.stalls_at(self.attempt_timeout)) => {
                        if watch.stalls_at(self.attempt_timeout) <= Instant::now() {
                            debug!(timeout = ?self.attempt_timeout, "request made no progress");
                            return Err(Error::Retryable(Failure::Timeout));
                        }
                    }
                }
            }
        };

        match sent {
            Ok(response) => Ok((conn, response)),
            Err(err) => match watch.take_source_error() {
                Some(local) => Err(Error::Io(local)),
                None => Err(Error::from_transport(err)),
            },
        }
    }
}

/// Watches a request body on its way into the connection.
///
/// Records when the connection last pulled a chunk, and keeps any error raised by the
/// body's own source so it is not mistaken for a network failure.
#[derive(Clone)]
struct BodyWatch {
    progress: Arc<Mutex<Instant>>,
    source_error: Arc<Mutex<Option<io::Error>>>,
}

impl BodyWatch {
    fn new() -> Self {
        Self {
            progress: Arc::new(Mutex::new(Instant::now())),
            source_error: Arc::new(Mutex::new(None)),
        }
    }

    fn observe(&self, body: Body) -> Body {
        match body {
            Body::Stream { len, chunks } => {
                let watch = self.clone();
                let chunks = chunks.map(move |item| watch.record(item)).boxed();
                Body::Stream { len, chunks }
            }
            other => other,
        }
    }

    fn record(&self, item: io::Result<Bytes>) -> io::Result<Bytes> {
        *self.progress.lock() = Instant::now();
        item.map_err(|err| {
            let forwarded =
                io::Error::new(err.kind(), format!("request body source failed: {err}"));
            *self.source_error.lock() = Some(err);
            forwarded
        })
    }

    fn stalls_at(&self, timeout: Duration) -> Instant {
        *self.progress.lock() + timeout
    }

    fn take_source_error(&self) -> Option<io::Error> {
        self.source_error.lock().take()
    }
}

/// A successful response whose body has not been read yet.
#[derive(Debug)]
pub struct Response {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body, holding the connection until it ends.
    pub body: ResponseBody,
}

impl Response {
    /// A header value, when present and valid UTF-8.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = HeaderName::from_bytes(name.as_ref().as_bytes()).ok()?;
        self.headers.get(name)?.to_str().ok()
    }

    /// The declared `content-length`.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }
}

/// A response body bound to its connection and call context.
///
/// The connection goes back to the pool only when the body is read to a clean end.
/// Errors, cancellation and dropping the body early abandon it.
pub struct ResponseBody {
    inner: Option<IncomingBody>,
    conn: Option<PooledConnection>,
    ctx: CallContext,
}

enum Polled {
    Cancelled,
    Next(Option<std::io::Result<Bytes>>),
}

impl ResponseBody {
    /// Next piece of the body, or `None` at its end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        let ctx = &self.ctx;
        let polled = tokio::select! {
            biased;
            _ = ctx.done() => Polled::Cancelled,
            next = inner.next() => Polled::Next(next),
        };

        match polled {
            Polled::Next(Some(Ok(bytes))) => Ok(Some(bytes)),
            Polled::Next(None) => {
                self.inner = None;
                if let Some(conn) = self.conn.take() {
                    conn.release();
                }
                Ok(None)
            }
            Polled::Next(Some(Err(err))) => {
                self.abandon();
                Err(Error::from_transport(err))
            }
            Polled::Cancelled => {
                self.abandon();
                Err(Error::Cancelled)
            }
        }
    }

    /// The body as a stream that ends after the first error.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        stream::unfold(self, |mut body| async move {
            match body.next_chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes), body)),
                Ok(None) => None,
                Err(err) => Some((Err(err), body)),
            }
        })
        .boxed()
    }

    /// Reads the whole body. Bodies over `limit` bytes are rejected as malformed.
    pub async fn bytes(mut self, limit: usize) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            if buf.len() + chunk.len() > limit {
                self.abandon();
                return Err(Error::Terminal(Failure::Malformed(format!(
                    "response body exceeds {limit} bytes"
                ))));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Reads and discards the rest of the body so the connection can be reused.
    pub async fn drain(mut self) -> Result<()> {
        while self.next_chunk().await?.is_some() {}
        Ok(())
    }

    fn abandon(&mut self) {
        self.inner = None;
        self.conn = None;
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("finished", &self.inner.is_none())
            .field("conn", &self.conn)
            .finish()
    }
}
