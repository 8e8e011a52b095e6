//! XML documents exchanged with the service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Failure, Result, ServiceError};

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Body of a ListObjectsV2 response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListBucketResult {
    /// Objects on this page.
    #[serde(default)]
    pub contents: Vec<Contents>,
    /// Key prefixes rolled up by the delimiter.
    #[serde(default)]
    pub common_prefixes: Vec<CommonPrefix>,
    /// More pages follow.
    #[serde(default)]
    pub is_truncated: bool,
    /// Token for the next page.
    #[serde(default)]
    pub next_continuation_token: Option<String>,
}

/// One object entry of a listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Contents {
    /// Object key.
    pub key: String,
    /// Last modification time.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    /// Entity tag, quoted as the service sends it.
    #[serde(default)]
    pub e_tag: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// A prefix rolled up by the delimiter.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonPrefix {
    /// The prefix, including the trailing delimiter.
    pub prefix: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorDocument {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CreateBucketConfiguration")]
struct CreateBucketConfiguration<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'a str,
    #[serde(rename = "LocationConstraint")]
    location_constraint: &'a str,
}

/// Parses a ListObjectsV2 page.
pub fn parse_list(body: &[u8]) -> Result<ListBucketResult> {
    let text = std::str::from_utf8(body)
        .map_err(|e| Error::Terminal(Failure::Malformed(format!("listing is not UTF-8: {e}"))))?;
    quick_xml::de::from_str(text)
        .map_err(|e| Error::Terminal(Failure::Malformed(format!("unreadable listing: {e}"))))
}

/// Builds the `ServiceError` of an error response.
///
/// Bodies that are empty, not UTF-8 or not an error document are tolerated; the code and
/// message then come from the status alone.
pub fn parse_error(status: u16, body: &[u8]) -> ServiceError {
    let doc = std::str::from_utf8(body)
        .ok()
        .filter(|text| !text.trim().is_empty())
        .and_then(|text| quick_xml::de::from_str::<ErrorDocument>(text).ok())
        .unwrap_or_default();

    ServiceError {
        status,
        code: doc
            .code
            .filter(|code| !code.is_empty())
            .unwrap_or_else(|| status_code(status).to_string()),
        message: doc.message.unwrap_or_else(|| {
            http::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or_default()
                .to_string()
        }),
        resource: doc.resource,
        request_id: doc.request_id,
    }
}

fn status_code(status: u16) -> &'static str {
    match status {
        301 => "PermanentRedirect",
        400 => "BadRequest",
        403 => "AccessDenied",
        404 => "NotFound",
        405 => "MethodNotAllowed",
        409 => "Conflict",
        412 => "PreconditionFailed",
        429 => "SlowDown",
        500 => "InternalError",
        501 => "NotImplemented",
        503 => "ServiceUnavailable",
        _ => "UnknownError",
    }
}

/// The `CreateBucketConfiguration` body for a bucket in `region`.
pub fn create_bucket_configuration(region: &str) -> Result<String> {
    quick_xml::se::to_string(&CreateBucketConfiguration {
        xmlns: S3_NAMESPACE,
        location_constraint: region,
    })
    .map_err(|e| Error::InvalidArgument(format!("cannot encode bucket configuration: {e}")))
}
