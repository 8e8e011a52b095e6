//! Byte-level network collaborator: how connections are opened and requests written.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::EndpointConfig;
use crate::request::Body;

/// Response payload as delivered by a connection.
pub type IncomingBody = BoxStream<'static, io::Result<Bytes>>;

/// One open connection to the storage endpoint.
#[async_trait]
pub trait Connection: Send {
    /// Writes the request head and body, then reads the response head.
    ///
    /// The returned body must be consumed to its end before the connection can carry
    /// another request.
    async fn send(
        &mut self,
        request: http::Request<Body>,
    ) -> io::Result<http::Response<IncomingBody>>;

    /// Whether the connection can still carry requests.
    fn is_open(&self) -> bool;
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Opens a fresh connection.
    async fn connect(&self, endpoint: &EndpointConfig) -> io::Result<Box<dyn Connection>>;
}

type OutgoingBody = UnsyncBoxBody<Bytes, io::Error>;

/// HTTP/1.1 over TCP, with optional TLS.
#[derive(Clone)]
pub struct HttpConnector {
    tls: Option<tokio_native_tls::TlsConnector>,
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl HttpConnector {
    /// A plain TCP connector.
    pub fn plain() -> Self {
        Self { tls: None }
    }

    /// A connector that wraps connections in TLS using the platform's trust store.
    pub fn tls() -> io::Result<Self> {
        let connector = native_tls::TlsConnector::new().map_err(io::Error::other)?;
        Ok(Self {
            tls: Some(connector.into()),
        })
    }

    /// A connector suited to `endpoint`.
    pub fn for_endpoint(endpoint: &EndpointConfig) -> io::Result<Self> {
        if endpoint.secure {
            Self::tls()
        } else {
            Ok(Self::plain())
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> io::Result<Box<dyn Connection>> {
        let host = endpoint.connect_host();
        let tcp = TcpStream::connect((host, endpoint.port)).await?;
        tcp.set_nodelay(true)?;

        let conn = match (&self.tls, endpoint.secure) {
            (Some(tls), true) => {
                let stream = tls.connect(host, tcp).await.map_err(io::Error::other)?;
                handshake(stream).await?
            }
            (None, true) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "endpoint requires TLS but the connector has none",
                ));
            }
            _ => handshake(tcp).await?,
        };
        debug!(host, port = endpoint.port, tls = endpoint.secure, "opened connection");
        Ok(Box::new(conn))
    }
}

async fn handshake<I>(io: I) -> io::Result<HttpConnection>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake::<_, OutgoingBody>(TokioIo::new(io))
        .await
        .map_err(hyper_to_io)?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(error = %err, "connection closed with error");
        }
    });
    Ok(HttpConnection { sender })
}

/// Maps a hyper error onto the `io::ErrorKind` the executor classifies by.
fn hyper_to_io(err: hyper::Error) -> io::Error {
    if err.is_parse() || err.is_parse_status() {
        return io::Error::new(io::ErrorKind::InvalidData, err);
    }
    if err.is_timeout() {
        return io::Error::new(io::ErrorKind::TimedOut, err);
    }
    if let Some(kind) = io_cause_kind(&err) {
        return io::Error::new(kind, err);
    }
    if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
        return io::Error::new(io::ErrorKind::ConnectionAborted, err);
    }
    io::Error::other(err)
}

fn io_cause_kind(err: &hyper::Error) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = cause.source();
    }
    None
}

struct HttpConnection {
    sender: http1::SendRequest<OutgoingBody>,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(
        &mut self,
        request: http::Request<Body>,
    ) -> io::Result<http::Response<IncomingBody>> {
        self.sender.ready().await.map_err(hyper_to_io)?;

        let (parts, body) = request.into_parts();
        let body = match body {
            Body::Empty => Empty::<Bytes>::new()
                .map_err(|never: Infallible| -> io::Error { match never {} })
                .boxed_unsync(),
            other => StreamBody::new(other.into_stream().map_ok(Frame::data)).boxed_unsync(),
        };
        let response = self
            .sender
            .send_request(http::Request::from_parts(parts, body))
            .await
            .map_err(hyper_to_io)?;

        Ok(response.map(|incoming| {
            incoming
                .into_data_stream()
                .map_err(hyper_to_io)
                .boxed()
        }))
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
