/*!
Streaming transform pipeline applied to raw snapshots.

Each stage wraps a [`ByteStream`] in another `Read`, so bytes are pulled through
compression and encryption as the store drains the stream. Memory stays bounded by the
stage buffers regardless of database size, and any error raised upstream surfaces
from the outermost `read` instead of producing a short but well-formed artifact.
*/

pub mod compression;
pub mod encryption;

use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::{CredentialHandle, CredentialProvider};
use crate::{BackupError, Result};

pub use compression::GzipCompressor;
pub use encryption::PassphraseEncryptor;

/// Owned byte stream passed between pipeline stages
pub type ByteStream = Box<dyn Read + Send>;

/// Base extension of a raw SQL dump
pub const BASE_EXTENSION: &str = "sql";

/// One composable stage of the pipeline
pub trait StreamTransform: Send + Sync {
    /// Wrap `input` so that reading yields transformed bytes
    fn apply(&self, input: ByteStream) -> Result<ByteStream>;

    /// Wrap stored bytes so that reading yields the stage's original input
    fn invert(&self, input: ByteStream) -> Result<ByteStream>;

    /// Extension segment this stage appends to artifact keys, if any
    fn extension(&self) -> Option<&str>;

    /// Get the name of the algorithm
    fn algorithm_name(&self) -> &str;
}

/// Compression stage selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionOption {
    None,
    Gzip { level: u32 },
}

/// Encryption stage selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionOption {
    None,
    Passphrase { credential: CredentialHandle },
}

/// Pipeline options as they appear in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOptions {
    pub compression: CompressionOption,
    pub encryption: EncryptionOption,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            compression: CompressionOption::Gzip { level: 6 },
            encryption: EncryptionOption::None,
        }
    }
}

/// Ordered list of stages: compression first, then encryption
pub struct TransformPipeline {
    stages: Vec<Box<dyn StreamTransform>>,
}

impl TransformPipeline {
    pub fn new(stages: Vec<Box<dyn StreamTransform>>) -> Self {
        Self { stages }
    }

    /// Build the pipeline described by `options`, resolving any passphrase handle.
    pub fn from_options(
        options: &TransformOptions,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self> {
        let mut stages: Vec<Box<dyn StreamTransform>> = Vec::new();
        match options.compression {
            CompressionOption::None => {}
            CompressionOption::Gzip { level } => {
                stages.push(Box::new(GzipCompressor::with_level(level)?));
            }
        }
        match &options.encryption {
            EncryptionOption::None => {}
            EncryptionOption::Passphrase { credential } => {
                let passphrase = credentials.resolve(credential)?;
                stages.push(Box::new(PassphraseEncryptor::new(passphrase)));
            }
        }
        Ok(Self::new(stages))
    }

    /// Rebuild the pipeline that produced an artifact from its key extension.
    ///
    /// Used to unpack artifacts written under earlier options. Decoding does not
    /// depend on the gzip level; an `enc` segment needs the passphrase handle in
    /// `options`.
    pub fn for_extension(
        extension: &str,
        options: &TransformOptions,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self> {
        let mut segments = extension.split('.');
        if segments.next() != Some(BASE_EXTENSION) {
            return Err(BackupError::validation(format!(
                "'{extension}' is not an artifact extension"
            )));
        }
        let mut stages: Vec<Box<dyn StreamTransform>> = Vec::new();
        for segment in segments {
            match segment {
                "gz" => stages.push(Box::new(GzipCompressor::new())),
                "enc" => {
                    let EncryptionOption::Passphrase { credential } = &options.encryption else {
                        return Err(BackupError::validation(
                            "artifact is encrypted but no passphrase is configured",
                        ));
                    };
                    let passphrase = credentials.resolve(credential)?;
                    stages.push(Box::new(PassphraseEncryptor::new(passphrase)));
                }
                other => {
                    return Err(BackupError::validation(format!(
                        "unknown transform stage '{other}' in extension '{extension}'"
                    )))
                }
            }
        }
        Ok(Self::new(stages))
    }

    /// Full artifact extension, e.g. `sql.gz.enc`
    pub fn extension(&self) -> String {
        std::iter::once(BASE_EXTENSION)
            .chain(self.stages.iter().filter_map(|stage| stage.extension()))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Stage names in application order, for logs
    pub fn describe(&self) -> String {
        if self.stages.is_empty() {
            return "identity".to_string();
        }
        self.stages
            .iter()
            .map(|stage| stage.algorithm_name())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Wrap a raw snapshot stream into the stored artifact stream.
    pub fn apply(&self, input: ByteStream) -> Result<ByteStream> {
        debug!(pipeline = %self.describe(), "applying transform pipeline");
        self.stages
            .iter()
            .try_fold(input, |stream, stage| stage.apply(stream))
    }

    /// Wrap a stored artifact stream back into the raw snapshot stream.
    pub fn invert(&self, stored: ByteStream) -> Result<ByteStream> {
        self.stages
            .iter()
            .rev()
            .try_fold(stored, |stream, stage| stage.invert(stream))
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new(vec![Box::new(GzipCompressor::new())])
    }
}
