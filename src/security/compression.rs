//! gzip framing for request and response bodies

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::io::{Read, Write};

/// Value of `Content-Encoding` / `Accept-Encoding` we speak
pub const GZIP: &str = "gzip";

/// Upper bound on a decompressed body
pub const MAX_DECOMPRESSED_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug)]
pub enum CompressionError {
    Io(std::io::Error),
    TooLarge,
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionError::Io(e) => write!(f, "gzip error: {}", e),
            CompressionError::TooLarge => {
                write!(f, "decompressed body exceeds {} bytes", MAX_DECOMPRESSED_BYTES)
            }
        }
    }
}

impl std::error::Error for CompressionError {}

impl From<std::io::Error> for CompressionError {
    fn from(e: std::io::Error) -> Self {
        CompressionError::Io(e)
    }
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = GzDecoder::new(data).take(MAX_DECOMPRESSED_BYTES + 1);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    if out.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(CompressionError::TooLarge);
    }
    Ok(out)
}

/// True when an `Accept-Encoding` style header lists gzip
pub fn accepts_gzip(header: &str) -> bool {
    header
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .any(|encoding| encoding.eq_ignore_ascii_case(GZIP))
}
