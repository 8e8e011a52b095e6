//! Walks through every facade operation against a live S3-compatible endpoint.
//!
//! Configuration comes from `MINIO_*` environment variables (see [`Config::from_env`]).

use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use futures::StreamExt;
use object_storage::{
    BucketCreation, CallContext, Config, ListOptions, ObjectStorage, PutOptions, ReaderSource,
};
use tracing::info;
use tracing_subscriber::prelude::*;

const BUCKET: &str = "test-bucket";
const FILE_OBJECT: &str = "test-file.txt";
const STRING_OBJECT: &str = "string-data.txt";
const FILE_CONTENT: &str = "Test file for MinIO";
const STRING_CONTENT: &str = "Data uploaded from a string";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "object_storage=info,walkthrough=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid MINIO_* configuration")?;
    info!(endpoint = %config.endpoint.authority(), secure = config.endpoint.secure, "connecting");
    let store = ObjectStorage::new(config).context("client creation failed")?;
    let ctx = CallContext::new();

    println!("Bucket creation...");
    match store.make_bucket(BUCKET, &ctx).await.context("bucket creation failed")? {
        BucketCreation::Created => println!("Bucket {BUCKET} successfully created"),
        BucketCreation::AlreadyOwned => println!("Bucket {BUCKET} already exists"),
    }

    println!("\nFile upload to bucket...");
    let upload_path = Path::new(FILE_OBJECT);
    tokio::fs::write(upload_path, FILE_CONTENT)
        .await
        .context("could not create the test file")?;
    let uploaded = store
        .fput_object(BUCKET, FILE_OBJECT, upload_path, PutOptions::content_type("text/plain"), &ctx)
        .await
        .context("file upload failed")?;
    println!("File {FILE_OBJECT} successfully uploaded, size {} bytes", uploaded.size);

    println!("\nUploading string data to bucket...");
    let source = ReaderSource::new(
        Cursor::new(STRING_CONTENT.as_bytes()),
        STRING_CONTENT.len() as u64,
    );
    let uploaded = store
        .put_object(BUCKET, STRING_OBJECT, source, PutOptions::content_type("text/plain"), &ctx)
        .await
        .context("string upload failed")?;
    println!("String uploaded as {STRING_OBJECT}, size {} bytes", uploaded.size);

    println!("\nList of objects in bucket:");
    let options = ListOptions {
        recursive: true,
        ..ListOptions::default()
    };
    let mut objects = store.list_objects(BUCKET, options, &ctx);
    while let Some(object) = objects.next().await {
        let object = object.context("listing failed")?;
        let modified = object
            .last_modified
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("- {} (size: {}, modified: {modified})", object.key, object.size);
    }

    println!("\nDownloading file...");
    let download_path = format!("downloaded-{FILE_OBJECT}");
    store
        .fget_object(BUCKET, FILE_OBJECT, &download_path, &ctx)
        .await
        .context("download failed")?;
    println!("File downloaded as {download_path}");

    println!("\nReading object as stream...");
    let mut reader = store
        .get_object_stream(BUCKET, STRING_OBJECT, &ctx)
        .await
        .context("could not open object")?;
    let mut buf = [0u8; 1024];
    let mut content = Vec::new();
    loop {
        let n = reader.read(&mut buf).await.context("reading object failed")?;
        if n == 0 {
            break;
        }
        content.extend_from_slice(&buf[..n]);
    }
    println!("Object content: {}", String::from_utf8_lossy(&content));

    println!("\nDeleting objects...");
    for key in [FILE_OBJECT, STRING_OBJECT] {
        store
            .remove_object(BUCKET, key, &ctx)
            .await
            .with_context(|| format!("deleting {key} failed"))?;
        println!("Object {key} deleted");
    }

    println!("\nDeleting bucket...");
    store
        .remove_bucket(BUCKET, &ctx)
        .await
        .context("bucket deletion failed")?;
    println!("Bucket {BUCKET} deleted");

    for path in [upload_path, Path::new(&download_path)] {
        if let Err(err) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %err, "could not remove local file");
        }
    }

    println!("\nAll operations completed successfully!");
    Ok(())
}
