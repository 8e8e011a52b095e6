//! Canonical request construction and the signing collaborator.
//!
//! The layout follows AWS Signature Version 4: the builder decides what is signed and
//! produces the string to sign, a [`Signer`] turns it into an `Authorization` header.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Signature algorithm identifier.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
/// Payload hash marker for bodies that are streamed rather than hashed.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// SHA-256 of the empty string.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const SERVICE: &str = "s3";

/// `x-amz-date` formatting of a timestamp.
pub fn amz_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Hex SHA-256 of a payload.
pub fn payload_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Credential scope: `date/region/s3/aws4_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// `YYYYMMDD`.
    pub date: String,
    /// Signing region.
    pub region: String,
}

impl Scope {
    /// Scope of a request signed at `timestamp` for `region`.
    pub fn new(timestamp: &DateTime<Utc>, region: &str) -> Self {
        Self {
            date: timestamp.format("%Y%m%d").to_string(),
            region: region.to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/aws4_request", self.date, self.region, SERVICE)
    }
}

/// The signable pieces of a request in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    /// HTTP method.
    pub method: String,
    /// URI-encoded absolute path.
    pub path: String,
    /// Sorted, encoded query string without the leading `?`.
    pub query: String,
    /// Lowercased header names with normalized values, sorted by name.
    pub headers: Vec<(String, String)>,
    /// Payload hash as sent in `x-amz-content-sha256`.
    pub payload_hash: String,
}

impl CanonicalRequest {
    /// `name1;name2;...` of the signed headers.
    pub fn signed_headers(&self) -> String {
        self.headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Builds the string to sign for this request.
    pub fn string_to_sign(&self, timestamp: &DateTime<Utc>, scope: &Scope) -> String {
        format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            amz_date(timestamp),
            payload_sha256(self.to_string().as_bytes())
        )
    }
}

impl fmt::Display for CanonicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.method)?;
        writeln!(f, "{}", self.path)?;
        writeln!(f, "{}", self.query)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}:{value}")?;
        }
        writeln!(f)?;
        writeln!(f, "{}", self.signed_headers())?;
        write!(f, "{}", self.payload_hash)
    }
}

/// Normalizes a header value for signing: trimmed, inner whitespace runs collapsed.
pub(crate) fn canonical_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Everything a signer needs to produce an `Authorization` header.
#[derive(Debug)]
pub struct SigningInput<'a> {
    /// Key material.
    pub credentials: &'a Credentials,
    /// Credential scope of the request.
    pub scope: &'a Scope,
    /// `;`-joined signed header names.
    pub signed_headers: &'a str,
    /// Output of [`CanonicalRequest::string_to_sign`].
    pub string_to_sign: &'a str,
}

/// Cryptographic signing capability.
pub trait Signer: Send + Sync + fmt::Debug {
    /// Returns the value of the `Authorization` header.
    fn authorization(&self, input: &SigningInput<'_>) -> String;
}

/// HMAC-SHA256 signer producing `AWS4-HMAC-SHA256` authorization headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha256Signer;

impl HmacSha256Signer {
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn signing_key(secret: &str, scope: &Scope) -> Vec<u8> {
        let k_date = Self::hmac(format!("AWS4{secret}").as_bytes(), scope.date.as_bytes());
        let k_region = Self::hmac(&k_date, scope.region.as_bytes());
        let k_service = Self::hmac(&k_region, SERVICE.as_bytes());
        Self::hmac(&k_service, b"aws4_request")
    }
}

impl Signer for HmacSha256Signer {
    fn authorization(&self, input: &SigningInput<'_>) -> String {
        let key = Self::signing_key(input.credentials.secret_access_key(), input.scope);
        let signature = hex::encode(Self::hmac(&key, input.string_to_sign.as_bytes()));
        format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={}, Signature={}",
            input.credentials.access_key_id(),
            input.scope,
            input.signed_headers,
            signature
        )
    }
}
