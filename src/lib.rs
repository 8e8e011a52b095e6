#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

//! An async client for S3-compatible object storage (MinIO, AWS S3 and friends).
//!
//! # Features
//! - Async operations with Tokio, each bounded by a [`CallContext`] (cancellation and deadline).
//! - AWS Signature V4 request signing with a pluggable [`Signer`](request::signing::Signer).
//! - Pooled HTTP/1.1 connections, reused only after a body was read to its end.
//! - Retries with exponential backoff and jitter, limited to requests that can be replayed.
//! - Streaming uploads and downloads in bounded chunks; objects are never fully buffered.
//! - Layered: Config → Request builder → Transport → Retry → [`ObjectStorage`] facade.
//!
//! # Usage
//! ```no_run
//! use object_storage::{CallContext, Config, ListOptions, ObjectStorage, PutOptions};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = ObjectStorage::new(Config::from_env()?)?;
//!     let ctx = CallContext::new();
//!
//!     store.make_bucket("test-bucket", &ctx).await?;
//!     let options = PutOptions::content_type("text/plain");
//!     store
//!         .put_bytes("test-bucket", "hello.txt", "hello", options, &ctx)
//!         .await?;
//!
//!     let options = ListOptions { recursive: true, ..ListOptions::default() };
//!     let mut objects = store.list_objects("test-bucket", options, &ctx);
//!     while let Some(object) = objects.next().await {
//!         let object = object?;
//!         println!("{} ({} bytes)", object.key, object.size);
//!     }
//!
//!     let mut data = Vec::new();
//!     store.get_object("test-bucket", "hello.txt", &mut data, &ctx).await?;
//!
//!     store.remove_object("test-bucket", "hello.txt", &ctx).await?;
//!     store.remove_bucket("test-bucket", &ctx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
mod object_storage;
pub mod request;
pub mod retry;
pub mod transfer;
pub mod transport;
mod xml;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

pub use crate::config::{Config, DEFAULT_REGION, EndpointConfig};
pub use crate::context::CallContext;
pub use crate::credentials::{CredentialCache, Credentials};
pub use crate::error::{Error, Failure, NameKind, Result, ServiceError};
pub use crate::object_storage::{
    BucketCreation, ListOptions, ObjectReader, ObjectStorage, PutOptions, UploadInfo,
};
pub use crate::retry::{Replay, RetryPolicy};
pub use crate::transfer::{
    BufferSource, ByteSink, ByteSource, FileSink, FileSource, ReaderSource, TransferChunk,
    WriterSink,
};

/// Metadata for an object, or for a key prefix in a one-level listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key, or the rolled-up prefix when `is_prefix` is set.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp.
    pub last_modified: Option<DateTime<Utc>>,
    /// ETag without quotes.
    pub etag: Option<String>,
    /// `content-type`, when the service reported one.
    pub content_type: Option<String>,
    /// User metadata (`x-amz-meta-*`), names without the prefix.
    pub metadata: BTreeMap<String, String>,
    /// Entry stands for a common prefix rather than an object.
    pub is_prefix: bool,
}
