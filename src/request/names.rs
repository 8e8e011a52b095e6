//! Bucket and object naming rules, checked before anything touches the network.

use std::net::Ipv4Addr;

use crate::error::{Error, NameKind, Result};

const MAX_KEY_LEN: usize = 1024;

fn invalid(kind: NameKind, name: &str, reason: &'static str) -> Error {
    Error::InvalidName {
        kind,
        name: name.to_string(),
        reason,
    }
}

/// Checks a bucket name against the S3 naming rules.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let bucket = |reason| Err(invalid(NameKind::Bucket, name, reason));

    if name.len() < 3 {
        return bucket("must be at least 3 characters long");
    }
    if name.len() > 63 {
        return bucket("must be at most 63 characters long");
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return bucket("may only contain lowercase letters, digits, '.' and '-'");
    }
    let first = name.as_bytes()[0];
    let last = name.as_bytes()[name.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return bucket("must start and end with a letter or digit");
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return bucket("must not contain adjacent periods or a period next to a hyphen");
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return bucket("must not be formatted as an IP address");
    }
    Ok(())
}

/// Checks an object key: non-empty, at most 1024 bytes, no control characters.
pub fn validate_object_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(invalid(NameKind::Object, key, "must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(invalid(NameKind::Object, key, "must be at most 1024 bytes long"));
    }
    if key.chars().any(|c| c.is_ascii_control()) {
        return Err(invalid(NameKind::Object, key, "must not contain control characters"));
    }
    Ok(())
}
