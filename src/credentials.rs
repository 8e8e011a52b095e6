//! Access keys and their rotation.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Access key pair plus an optional session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    /// Static long-term credentials.
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Attaches a session token (temporary credentials).
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Access key id, sent in clear in the credential scope.
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Secret key used to derive signing keys.
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    /// Session token of temporary credentials.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

// Keeps secrets out of logs and panic messages.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Shared holder of the current credentials.
///
/// Each request takes a snapshot, so a rotation never yields a half-updated key pair.
#[derive(Debug)]
pub struct CredentialCache {
    current: RwLock<Arc<Credentials>>,
}

impl CredentialCache {
    /// Starts the cache with `credentials`.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(Arc::new(credentials)),
        }
    }

    /// The credentials to sign the next request with.
    pub fn snapshot(&self) -> Arc<Credentials> {
        self.current.read().clone()
    }

    /// Replaces the credentials for all requests built after this call.
    pub fn rotate(&self, credentials: Credentials) {
        *self.current.write() = Arc::new(credentials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = Credentials::new("AKID", "very-secret").with_session_token("tok");
        let out = format!("{creds:?}");
        assert!(out.contains("AKID"));
        assert!(!out.contains("very-secret"));
        assert!(!out.contains("tok\""));
    }

    #[test]
    fn rotation_does_not_affect_taken_snapshots() {
        let cache = CredentialCache::new(Credentials::new("old", "s1"));
        let before = cache.snapshot();
        cache.rotate(Credentials::new("new", "s2"));
        assert_eq!(before.access_key_id(), "old");
        assert_eq!(cache.snapshot().access_key_id(), "new");
    }
}
