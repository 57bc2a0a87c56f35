/*!
Compression stages for snapshot streams.

The gzip stage uses the DEFLATE algorithm through flate2's pull-based encoder. The
gzip header carries no timestamp or file name, so identical input yields identical
output.
*/

use flate2::{read::GzDecoder, read::GzEncoder, Compression};

use super::{ByteStream, StreamTransform};
use crate::{BackupError, Result};

/// Gzip compression stage
///
/// # Example
/// ```rust
/// use backstop_core::transform::{GzipCompressor, StreamTransform};
/// use std::io::{Cursor, Read};
///
/// let compressor = GzipCompressor::new();
/// let mut compressed = Vec::new();
/// compressor
///     .apply(Box::new(Cursor::new(b"INSERT INTO t VALUES (1);".to_vec())))?
///     .read_to_end(&mut compressed)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level
    ///
    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 is no compression and 9 is maximum)
    pub fn with_level(level: u32) -> Result<Self> {
        if level > 9 {
            return Err(BackupError::validation(format!(
                "gzip level must be between 0 and 9, got {level}"
            )));
        }
        Ok(Self {
            compression_level: Compression::new(level),
        })
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTransform for GzipCompressor {
    fn apply(&self, input: ByteStream) -> Result<ByteStream> {
        Ok(Box::new(GzEncoder::new(input, self.compression_level)))
    }

    fn invert(&self, input: ByteStream) -> Result<ByteStream> {
        Ok(Box::new(GzDecoder::new(input)))
    }

    fn extension(&self) -> Option<&str> {
        Some("gz")
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn run(stage: &dyn StreamTransform, data: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        stage
            .apply(Box::new(Cursor::new(data)))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn undo(stage: &dyn StreamTransform, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        stage
            .invert(Box::new(Cursor::new(data)))
            .unwrap()
            .read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_gzip_compression_roundtrip() {
        let compressor = GzipCompressor::new();
        let original = b"INSERT INTO orders VALUES (42, 'repetitive payload');\n".repeat(200);

        let compressed = run(&compressor, original.clone());
        assert!(compressed.len() < original.len());
        assert_eq!(undo(&compressor, compressed).unwrap(), original);
    }

    #[test]
    fn test_gzip_compression_levels() {
        let data = b"Some dump text to compress with different levels".repeat(200);

        let fast = run(&GzipCompressor::with_level(1).unwrap(), data.clone());
        let best = run(&GzipCompressor::with_level(9).unwrap(), data.clone());
        assert!(best.len() <= fast.len());
        assert_eq!(GzipCompressor::new().level(), 6);
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(GzipCompressor::with_level(10).is_err());
        assert_eq!(GzipCompressor::with_level(3).unwrap().level(), 3);
    }

    #[test]
    fn test_truncated_gzip_fails_to_decode() {
        let compressor = GzipCompressor::new();
        let mut compressed = run(&compressor, b"CREATE TABLE t (id INT);\n".repeat(100));
        compressed.truncate(compressed.len() / 2);

        assert!(undo(&compressor, compressed).is_err());
    }

    #[test]
    fn test_gzip_empty_data() {
        let compressor = GzipCompressor::new();
        let compressed = run(&compressor, Vec::new());
        assert!(undo(&compressor, compressed).unwrap().is_empty());
    }
}
