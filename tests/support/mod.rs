//! In-memory S3 stand-in plugged in through the `Connector` seam.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use object_storage::config::EndpointConfig;
use object_storage::request::Body;
use object_storage::transport::connector::{Connection, Connector, IncomingBody};
use object_storage::{Config, ObjectStorage, RetryPolicy};

const LAST_MODIFIED_XML: &str = "2024-03-01T10:00:00.000Z";
const LAST_MODIFIED_HTTP: &str = "Fri, 01 Mar 2024 10:00:00 GMT";

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    metadata: Vec<(String, String)>,
    etag: String,
}

/// A request as the fake service received it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: http::Method,
    pub target: String,
    pub access_key: String,
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    injected: VecDeque<u16>,
    requests: Vec<Recorded>,
}

#[derive(Debug, Clone)]
pub struct FakeS3 {
    state: Arc<Mutex<State>>,
    chunk: usize,
    connects: Arc<AtomicUsize>,
}

impl FakeS3 {
    pub fn new() -> Self {
        Self::with_chunk_size(1024)
    }

    /// Response bodies are delivered in frames of `chunk` bytes.
    pub fn with_chunk_size(chunk: usize) -> Self {
        Self {
            state: Arc::default(),
            chunk,
            connects: Arc::default(),
        }
    }

    /// The next request is answered with `status` instead of being served.
    pub fn inject(&self, status: u16) {
        self.state.lock().injected.push_back(status);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().requests.clone()
    }

    pub fn count(&self, method: http::Method) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock();
        Some(state.buckets.get(bucket)?.get(key)?.data.clone())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Client defaults tuned for tests: small chunks and millisecond backoff.
    pub fn config(&self) -> Config {
        Config {
            chunk_size: self.chunk,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                max_attempts: 5,
            },
            ..Config::default()
        }
    }

    pub fn client(&self) -> ObjectStorage {
        self.client_with(self.config())
    }

    pub fn client_with(&self, config: Config) -> ObjectStorage {
        ObjectStorage::with_connector(config, Arc::new(self.clone())).expect("valid test config")
    }
}

#[async_trait]
impl Connector for FakeS3 {
    async fn connect(&self, _endpoint: &EndpointConfig) -> io::Result<Box<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            server: self.clone(),
        }))
    }
}

struct FakeConnection {
    server: FakeS3,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(
        &mut self,
        request: http::Request<Body>,
    ) -> io::Result<http::Response<IncomingBody>> {
        let (parts, body) = request.into_parts();
        let chunks: Vec<Bytes> = body.into_stream().try_collect().await?;
        let body = Bytes::from(chunks.concat());

        let reply = {
            let mut state = self.server.state.lock();
            state.requests.push(Recorded {
                method: parts.method.clone(),
                target: parts.uri.to_string(),
                access_key: access_key(&parts.headers),
                body: body.clone(),
            });
            match state.injected.pop_front() {
                Some(status) => error(status, "InjectedFailure", "injected by the test", ""),
                None => serve(&mut state, &parts, body),
            }
        };

        let mut response = http::Response::builder().status(reply.status);
        for (name, value) in &reply.headers {
            response = response.header(name.as_str(), value.as_str());
        }
        let chunk = self.server.chunk.max(1);
        let frames: Vec<io::Result<Bytes>> = (0..reply.body.len())
            .step_by(chunk)
            .map(|start| Ok(reply.body.slice(start..(start + chunk).min(reply.body.len()))))
            .collect();
        response
            .body(stream::iter(frames).boxed())
            .map_err(io::Error::other)
    }

    fn is_open(&self) -> bool {
        true
    }
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Reply {
    fn empty(status: u16) -> Self {
        Reply {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    fn xml(status: u16, xml: String) -> Self {
        Reply {
            status,
            headers: vec![
                ("content-type".into(), "application/xml".into()),
                ("content-length".into(), xml.len().to_string()),
            ],
            body: Bytes::from(xml),
        }
    }
}

fn error(status: u16, code: &str, message: &str, resource: &str) -> Reply {
    Reply::xml(
        status,
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{code}</Code>\
             <Message>{}</Message><Resource>{}</Resource><RequestId>FAKE0001</RequestId></Error>",
            escape(message),
            escape(resource)
        ),
    )
}

fn access_key(headers: &http::HeaderMap) -> String {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split("Credential=").nth(1))
        .and_then(|v| v.split('/').next())
        .unwrap_or_default()
        .to_string()
}

fn header<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn serve(state: &mut State, parts: &http::request::Parts, body: Bytes) -> Reply {
    let authorized = header(&parts.headers, "authorization")
        .is_some_and(|auth| auth.starts_with("AWS4-HMAC-SHA256 Credential="));
    if !authorized {
        return error(403, "AccessDenied", "missing signature", parts.uri.path());
    }
    match header(&parts.headers, "x-amz-content-sha256") {
        Some("UNSIGNED-PAYLOAD") => {}
        Some(hash) if hash == hex::encode(Sha256::digest(&body)) => {}
        _ => {
            return error(
                400,
                "XAmzContentSHA256Mismatch",
                "payload hash mismatch",
                parts.uri.path(),
            );
        }
    }
    if let Some(len) = header(&parts.headers, "content-length") {
        if len.parse::<usize>().ok() != Some(body.len()) {
            return error(400, "IncompleteBody", "content-length mismatch", parts.uri.path());
        }
    }

    let path = parts.uri.path().trim_start_matches('/');
    let (bucket, key) = match path.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), Some(decode(key))),
        None => (path.to_string(), None),
    };
    let query = parse_query(parts.uri.query().unwrap_or_default());
    let resource = parts.uri.path();

    match (&parts.method, key) {
        (&http::Method::PUT, None) => {
            if state.buckets.contains_key(&bucket) {
                error(409, "BucketAlreadyOwnedByYou", "bucket already owned", resource)
            } else {
                state.buckets.insert(bucket, BTreeMap::new());
                Reply::empty(200)
            }
        }
        (&http::Method::HEAD, None) => {
            if state.buckets.contains_key(&bucket) {
                Reply::empty(200)
            } else {
                Reply::empty(404)
            }
        }
        (&http::Method::DELETE, None) => match state.buckets.get(&bucket) {
            None => error(404, "NoSuchBucket", "no such bucket", resource),
            Some(objects) if !objects.is_empty() => {
                error(409, "BucketNotEmpty", "bucket is not empty", resource)
            }
            Some(_) => {
                state.buckets.remove(&bucket);
                Reply::empty(204)
            }
        },
        (&http::Method::GET, None) => match state.buckets.get(&bucket) {
            None => error(404, "NoSuchBucket", "no such bucket", resource),
            Some(objects) => list(&bucket, objects, &query),
        },
        (method, Some(key)) => {
            let Some(objects) = state.buckets.get_mut(&bucket) else {
                return error(404, "NoSuchBucket", "no such bucket", resource);
            };
            match *method {
                http::Method::PUT => {
                    let etag = hex::encode(&Sha256::digest(&body)[..16]);
                    let metadata = parts
                        .headers
                        .iter()
                        .filter(|(name, _)| name.as_str().starts_with("x-amz-meta-"))
                        .map(|(name, value)| {
                            (name.to_string(), value.to_str().unwrap_or_default().to_string())
                        })
                        .collect();
                    objects.insert(
                        key,
                        StoredObject {
                            data: body,
                            content_type: header(&parts.headers, "content-type")
                                .unwrap_or("binary/octet-stream")
                                .to_string(),
                            metadata,
                            etag: etag.clone(),
                        },
                    );
                    Reply {
                        status: 200,
                        headers: vec![("etag".into(), format!("\"{etag}\""))],
                        body: Bytes::new(),
                    }
                }
                http::Method::GET | http::Method::HEAD => match objects.get(&key) {
                    None if *method == http::Method::HEAD => Reply::empty(404),
                    None => error(404, "NoSuchKey", "no such key", resource),
                    Some(object) => {
                        let mut headers = vec![
                            ("content-length".to_string(), object.data.len().to_string()),
                            ("content-type".to_string(), object.content_type.clone()),
                            ("etag".to_string(), format!("\"{}\"", object.etag)),
                            ("last-modified".to_string(), LAST_MODIFIED_HTTP.to_string()),
                        ];
                        headers.extend(object.metadata.iter().cloned());
                        let body = if *method == http::Method::GET {
                            object.data.clone()
                        } else {
                            Bytes::new()
                        };
                        Reply {
                            status: 200,
                            headers,
                            body,
                        }
                    }
                },
                http::Method::DELETE => {
                    objects.remove(&key);
                    Reply::empty(204)
                }
                _ => error(405, "MethodNotAllowed", "method not allowed", resource),
            }
        }
        _ => error(405, "MethodNotAllowed", "method not allowed", resource),
    }
}

fn list(
    bucket: &str,
    objects: &BTreeMap<String, StoredObject>,
    query: &HashMap<String, String>,
) -> Reply {
    let prefix = query.get("prefix").map(String::as_str).unwrap_or_default();
    let delimiter = query.get("delimiter").map(String::as_str);
    let max_keys: usize = query
        .get("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let token = query.get("continuation-token");

    // Name -> object, or None for a rolled-up prefix.
    let mut entries: BTreeMap<String, Option<&StoredObject>> = BTreeMap::new();
    for (key, object) in objects.range(prefix.to_string()..) {
        if !key.starts_with(prefix) {
            break;
        }
        let rest = &key[prefix.len()..];
        match delimiter.and_then(|d| rest.find(d).map(|pos| pos + d.len())) {
            Some(end) => {
                entries.insert(key[..prefix.len() + end].to_string(), None);
            }
            None => {
                entries.insert(key.clone(), Some(object));
            }
        }
    }

    let mut page: Vec<_> = entries
        .into_iter()
        .filter(|(name, _)| token.is_none_or(|t| name > t))
        .collect();
    let truncated = page.len() > max_keys;
    page.truncate(max_keys);

    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Name>{bucket}</Name><Prefix>{}</Prefix><KeyCount>{}</KeyCount>\
         <MaxKeys>{max_keys}</MaxKeys>\
         <IsTruncated>{truncated}</IsTruncated>",
        escape(prefix),
        page.len()
    );
    if truncated {
        if let Some((last, _)) = page.last() {
            xml.push_str(&format!(
                "<NextContinuationToken>{}</NextContinuationToken>",
                escape(last)
            ));
        }
    }
    for (name, object) in &page {
        if let Some(object) = object {
            xml.push_str(&format!(
                "<Contents><Key>{}</Key><LastModified>{LAST_MODIFIED_XML}</LastModified>\
                 <ETag>&quot;{}&quot;</ETag><Size>{}</Size>\
                 <StorageClass>STANDARD</StorageClass></Contents>",
                escape(name),
                object.etag,
                object.data.len()
            ));
        }
    }
    for (name, object) in &page {
        if object.is_none() {
            xml.push_str(&format!(
                "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
                escape(name)
            ));
        }
    }
    xml.push_str("</ListBucketResult>");
    Reply::xml(200, xml)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(name), decode(value))
        })
        .collect()
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
