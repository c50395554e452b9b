//! Payload compression seam.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CrosstalkError, Result};

/// Compresses payload bytes after (optional) encryption on the way out and
/// reverses the transform before decryption on the way in.
pub trait Compressor: Send + Sync {
    /// Compress `data`.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Decompress `data`.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Gzip compressor. The default when compression is enabled.
#[derive(Debug, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|err| CrosstalkError::Decode {
            token: None,
            reason: format!("gzip decompression failed: {err}"),
        })?;
        Ok(out)
    }
}
