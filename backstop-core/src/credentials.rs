/*!
Opaque credential handles.

Configuration refers to secrets by handle (`env:NAME` or `file:/path`). Handles are
resolved through a [`CredentialProvider`] into a [`Secret`], which never prints its
value through `Debug` or `Display`.
*/

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BackupError, Result};

/// Secret material kept out of logs
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Reference to a secret held by an external provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialHandle(String);

impl CredentialHandle {
    pub fn new<S: Into<String>>(handle: S) -> Self {
        Self(handle.into())
    }

    pub fn env<S: AsRef<str>>(name: S) -> Self {
        Self(format!("env:{}", name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves handles into secret material
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, handle: &CredentialHandle) -> Result<Secret>;
}

/// Resolves `env:NAME` from the process environment and `file:/path` from disk.
///
/// File secrets have one trailing newline stripped, matching how secret files are
/// usually mounted.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn resolve(&self, handle: &CredentialHandle) -> Result<Secret> {
        if let Some(name) = handle.as_str().strip_prefix("env:") {
            return std::env::var(name).map(Secret::new).map_err(|_| {
                BackupError::validation(format!("credential {handle} is not set"))
            });
        }
        if let Some(path) = handle.as_str().strip_prefix("file:") {
            let raw = std::fs::read_to_string(Path::new(path)).map_err(|e| {
                BackupError::validation(format!("credential {handle} is unreadable: {e}"))
            })?;
            let value = raw
                .strip_suffix('\n')
                .map(|v| v.strip_suffix('\r').unwrap_or(v))
                .unwrap_or(&raw);
            return Ok(Secret::new(value));
        }
        Err(BackupError::validation(format!(
            "unsupported credential handle '{handle}' (expected env:NAME or file:/path)"
        )))
    }
}

/// Fixed handle table, used when embedding the engine or in tests
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialProvider {
    secrets: HashMap<CredentialHandle, Secret>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: Into<String>>(mut self, handle: CredentialHandle, secret: S) -> Self {
        self.secrets.insert(handle, Secret::new(secret));
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, handle: &CredentialHandle) -> Result<Secret> {
        self.secrets
            .get(handle)
            .cloned()
            .ok_or_else(|| BackupError::validation(format!("credential {handle} is not known")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_env_handle() {
        std::env::set_var("BACKSTOP_TEST_CREDENTIAL", "s3cret");
        let secret = EnvCredentialProvider
            .resolve(&CredentialHandle::env("BACKSTOP_TEST_CREDENTIAL"))
            .unwrap();
        assert_eq!(secret.expose(), "s3cret");

        assert!(EnvCredentialProvider
            .resolve(&CredentialHandle::env("BACKSTOP_TEST_CREDENTIAL_MISSING"))
            .is_err());
    }

    #[test]
    fn test_file_handle_strips_trailing_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "passphrase with spaces").unwrap();
        let handle = CredentialHandle::new(format!("file:{}", file.path().display()));

        let secret = EnvCredentialProvider.resolve(&handle).unwrap();
        assert_eq!(secret.expose(), "passphrase with spaces");
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let err = EnvCredentialProvider
            .resolve(&CredentialHandle::new("vault:db/password"))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported credential handle"));
    }

    #[test]
    fn test_static_provider() {
        let handle = CredentialHandle::new("backup-passphrase");
        let provider = StaticCredentialProvider::new().with(handle.clone(), "correct horse");
        assert_eq!(provider.resolve(&handle).unwrap().expose(), "correct horse");
        assert!(provider.resolve(&CredentialHandle::new("other")).is_err());
    }
}
