//! Turns an operation descriptor into a fully-addressed, signed request.

pub mod names;
pub mod signing;

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;

use crate::config::EndpointConfig;
use crate::credentials::Credentials;
use crate::error::{Error, Result};

use self::names::{validate_bucket_name, validate_object_key};
use self::signing::{
    CanonicalRequest, EMPTY_PAYLOAD_SHA256, Scope, Signer, SigningInput, UNSIGNED_PAYLOAD,
    amz_date, canonical_header_value, payload_sha256,
};

/// The storage operations the client knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `PUT /bucket`
    CreateBucket,
    /// `HEAD /bucket`
    HeadBucket,
    /// `DELETE /bucket`
    DeleteBucket,
    /// `GET /bucket?list-type=2`
    ListObjects,
    /// `PUT /bucket/key`
    PutObject,
    /// `GET /bucket/key`
    GetObject,
    /// `HEAD /bucket/key`
    HeadObject,
    /// `DELETE /bucket/key`
    DeleteObject,
}

impl OperationKind {
    /// HTTP method of the operation.
    pub fn method(self) -> Method {
        use OperationKind::*;
        match self {
            CreateBucket | PutObject => Method::PUT,
            HeadBucket | HeadObject => Method::HEAD,
            DeleteBucket | DeleteObject => Method::DELETE,
            ListObjects | GetObject => Method::GET,
        }
    }

    /// Whether the operation addresses an object rather than a bucket.
    pub fn targets_object(self) -> bool {
        matches!(
            self,
            OperationKind::PutObject
                | OperationKind::GetObject
                | OperationKind::HeadObject
                | OperationKind::DeleteObject
        )
    }
}

/// Describes one storage call independently of any attempt.
#[derive(Debug, Clone)]
pub struct Operation {
    /// What to do.
    pub kind: OperationKind,
    /// Target bucket.
    pub bucket: String,
    /// Target object, for object operations.
    pub key: Option<String>,
    /// Query parameters (unencoded).
    pub query: Vec<(String, String)>,
    /// Extra request headers.
    pub headers: HeaderMap,
}

impl Operation {
    /// An operation on a bucket.
    pub fn bucket(kind: OperationKind, bucket: impl Into<String>) -> Self {
        Self {
            kind,
            bucket: bucket.into(),
            key: None,
            query: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    /// An operation on an object.
    pub fn object(kind: OperationKind, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bucket(kind, bucket)
        }
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets a header, replacing any previous value of the same name.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::InvalidArgument(format!("invalid value for header {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Checks names against the naming rules.
    pub fn validate(&self) -> Result<()> {
        validate_bucket_name(&self.bucket)?;
        match (&self.key, self.kind.targets_object()) {
            (Some(key), true) => validate_object_key(key),
            (None, true) => Err(Error::InvalidArgument(format!(
                "{:?} requires an object key",
                self.kind
            ))),
            (Some(_), false) => Err(Error::InvalidArgument(format!(
                "{:?} does not take an object key",
                self.kind
            ))),
            (None, false) => Ok(()),
        }
    }
}

/// Request payload of one attempt.
pub enum Body {
    /// No payload.
    Empty,
    /// In-memory payload; hashed and signed.
    Buffer(Bytes),
    /// Lazily produced payload of a declared length; sent as `UNSIGNED-PAYLOAD`.
    Stream {
        /// Number of bytes the stream will yield.
        len: u64,
        /// The payload.
        chunks: BoxStream<'static, io::Result<Bytes>>,
    },
}

impl Body {
    /// Number of bytes that will be sent.
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Buffer(bytes) => bytes.len() as u64,
            Body::Stream { len, .. } => *len,
        }
    }

    /// Whether no bytes will be sent.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn payload_hash(&self) -> String {
        match self {
            Body::Empty => EMPTY_PAYLOAD_SHA256.to_string(),
            Body::Buffer(bytes) => payload_sha256(bytes),
            Body::Stream { .. } => UNSIGNED_PAYLOAD.to_string(),
        }
    }

    /// The payload as a byte stream.
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            Body::Empty => stream::empty().boxed(),
            Body::Buffer(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream { chunks, .. } => chunks,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            Body::Stream { len, .. } => write!(f, "Stream({len} bytes)"),
        }
    }
}

/// A signed request, ready for one attempt.
#[derive(Debug)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Encoded path, `/bucket` or `/bucket/key`.
    pub path: String,
    /// Encoded canonical query, empty when there is none.
    pub query: String,
    /// Headers including `authorization`.
    pub headers: HeaderMap,
    /// Payload.
    pub body: Body,
    /// The string that was signed.
    pub signing_string: String,
}

impl Request {
    /// Origin-form request target.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Converts into an `http` request for the transport.
    pub fn into_http(self) -> Result<http::Request<Body>> {
        let target = self.target();
        let mut request = http::Request::builder()
            .method(self.method)
            .uri(target.as_str())
            .body(self.body)
            .map_err(|e| {
                Error::InvalidArgument(format!("invalid request target {target:?}: {e}"))
            })?;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

fn encode_path(bucket: &str, key: Option<&str>) -> String {
    let mut path = format!("/{}", urlencoding::encode(bucket));
    if let Some(key) = key {
        for segment in key.split('/') {
            path.push('/');
            path.push_str(&urlencoding::encode(segment));
        }
    }
    path
}

fn encode_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn is_signed(name: &HeaderName) -> bool {
    *name == header::HOST
        || *name == header::CONTENT_TYPE
        || name.as_str() == "content-md5"
        || name.as_str().starts_with("x-amz-")
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::InvalidArgument(format!("invalid header value {value:?}")))
}

/// Builds signed requests against one endpoint.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    endpoint: EndpointConfig,
    signer: Arc<dyn Signer>,
}

impl RequestBuilder {
    /// A builder for `endpoint` that signs with `signer`.
    pub fn new(endpoint: EndpointConfig, signer: Arc<dyn Signer>) -> Self {
        Self { endpoint, signer }
    }

    /// The endpoint requests are addressed to.
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Validates, addresses and signs `op` with `body` at `timestamp`.
    ///
    /// The signing string depends only on the arguments, so identical inputs give a
    /// byte-identical result.
    pub fn build(
        &self,
        op: &Operation,
        credentials: &Credentials,
        body: Body,
        timestamp: DateTime<Utc>,
    ) -> Result<Request> {
        op.validate()?;

        let method = op.kind.method();
        let path = encode_path(&op.bucket, op.key.as_deref());
        let query = encode_query(&op.query);
        let payload_hash = body.payload_hash();

        let mut headers = op.headers.clone();
        headers.insert(header::HOST, header_value(&self.endpoint.authority())?);
        headers.insert(
            HeaderName::from_static("x-amz-date"),
            header_value(&amz_date(&timestamp))?,
        );
        headers.insert(
            HeaderName::from_static("x-amz-content-sha256"),
            header_value(&payload_hash)?,
        );
        if !body.is_empty() || method == Method::PUT {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        if let Some(token) = credentials.session_token() {
            headers.insert(
                HeaderName::from_static("x-amz-security-token"),
                header_value(token)?,
            );
        }

        let mut signed: Vec<(String, String)> = Vec::new();
        for name in headers.keys().filter(|name| is_signed(name)) {
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .map(|v| canonical_header_value(&String::from_utf8_lossy(v.as_bytes())))
                .collect();
            signed.push((name.as_str().to_string(), values.join(",")));
        }
        signed.sort();

        let canonical = CanonicalRequest {
            method: method.to_string(),
            path: path.clone(),
            query: query.clone(),
            headers: signed,
            payload_hash,
        };
        let scope = Scope::new(&timestamp, &self.endpoint.region);
        let signing_string = canonical.string_to_sign(&timestamp, &scope);
        let signed_headers = canonical.signed_headers();
        let authorization = self.signer.authorization(&SigningInput {
            credentials,
            scope: &scope,
            signed_headers: &signed_headers,
            string_to_sign: &signing_string,
        });
        headers.insert(header::AUTHORIZATION, header_value(&authorization)?);

        Ok(Request {
            method,
            path,
            query,
            headers,
            body,
            signing_string,
        })
    }
}
