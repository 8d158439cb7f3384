//! Record payload compression.
//!
//! A record's index array, user header and events are compressed together as
//! one block. The codec set is closed (none, LZ4 fast, LZ4 best, gzip) and is
//! identified on the wire by the top nibble of header word 9.
//!
//! # Features
//!
//! - `compression-lz4`: LZ4 block codec. Fast records are encoded with
//!   `lz4_flex`, best records with the reference high compression encoder;
//!   both emit raw LZ4 blocks and decode through `lz4_flex`.
//! - `compression-gzip`: gzip stream codec

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::{EvioError, Result};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionType {
    #[default]
    None = 0,
    Lz4 = 1,
    Lz4Best = 2,
    Gzip = 3,
}

impl CompressionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Lz4Best),
            3 => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self != CompressionType::None
    }

    /// Is support for this codec compiled in?
    pub fn is_available(self) -> bool {
        match self {
            CompressionType::None => true,
            CompressionType::Lz4 | CompressionType::Lz4Best => cfg!(feature = "compression-lz4"),
            CompressionType::Gzip => cfg!(feature = "compression-gzip"),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
            CompressionType::Lz4Best => "lz4-best",
            CompressionType::Gzip => "gzip",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CompressionType {
    type Err = EvioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(CompressionType::None),
            "lz4" | "1" => Ok(CompressionType::Lz4),
            "lz4-best" | "lz4best" | "2" => Ok(CompressionType::Lz4Best),
            "gzip" | "3" => Ok(CompressionType::Gzip),
            other => Err(EvioError::unsupported(format!("unknown compression type `{other}`"))),
        }
    }
}

/// Compress a record body.
pub fn compress(codec: CompressionType, raw: &[u8]) -> Result<Vec<u8>> {
    let packed = match codec {
        CompressionType::None => Ok(raw.to_vec()),
        CompressionType::Lz4 => compress_lz4(raw),
        CompressionType::Lz4Best => compress_lz4_best(raw),
        CompressionType::Gzip => compress_gzip(raw),
    };
    packed.map_err(|e| EvioError::Compression(format!("{codec} compression failed: {e}")))
}

/// Decompress a record body, checking it expands to exactly `expected_len` bytes.
pub fn decompress(codec: CompressionType, payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    decompress_into(codec, payload, expected_len, &mut out)?;
    Ok(out)
}

/// Like [`decompress`] but appends to `out`, so callers can reuse one buffer
/// for a whole sequence of records. On failure `out` is restored to its
/// original length.
pub fn decompress_into(
    codec: CompressionType,
    payload: &[u8],
    expected_len: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    let start = out.len();
    let decoded = match codec {
        CompressionType::None => {
            out.extend_from_slice(payload);
            Ok(())
        }
        CompressionType::Lz4 | CompressionType::Lz4Best => decompress_lz4(payload, expected_len, out),
        CompressionType::Gzip => decompress_gzip(payload, out),
    };

    if let Err(e) = decoded {
        out.truncate(start);
        return Err(EvioError::Compression(format!("{codec} decompression failed: {e}")));
    }

    let produced = out.len() - start;
    if produced != expected_len {
        out.truncate(start);
        return Err(EvioError::Compression(format!(
            "{codec} record size mismatch: expected {expected_len} bytes, got {produced}"
        )));
    }
    Ok(())
}

fn compress_lz4(_raw: &[u8]) -> io::Result<Vec<u8>> {
    #[cfg(feature = "compression-lz4")]
    {
        return Ok(lz4_flex::block::compress(_raw));
    }

    #[cfg(not(feature = "compression-lz4"))]
    {
        Err(io::Error::other("lz4 compression support not enabled (enable feature `compression-lz4`)"))
    }
}

/// Highest LZ4 HC level.
#[cfg(feature = "compression-lz4")]
const LZ4_BEST_LEVEL: i32 = 12;

fn compress_lz4_best(_raw: &[u8]) -> io::Result<Vec<u8>> {
    #[cfg(feature = "compression-lz4")]
    {
        return lz4::block::compress(
            _raw,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(LZ4_BEST_LEVEL)),
            false,
        );
    }

    #[cfg(not(feature = "compression-lz4"))]
    {
        Err(io::Error::other("lz4 compression support not enabled (enable feature `compression-lz4`)"))
    }
}

fn decompress_lz4(_payload: &[u8], _expected_len: usize, _out: &mut Vec<u8>) -> io::Result<()> {
    #[cfg(feature = "compression-lz4")]
    {
        let start = _out.len();
        _out.resize(start + _expected_len, 0);
        let n = lz4_flex::block::decompress_into(_payload, &mut _out[start..]).map_err(io::Error::other)?;
        _out.truncate(start + n);
        return Ok(());
    }

    #[cfg(not(feature = "compression-lz4"))]
    {
        Err(io::Error::other("lz4 decompression support not enabled (enable feature `compression-lz4`)"))
    }
}

fn compress_gzip(_raw: &[u8]) -> io::Result<Vec<u8>> {
    #[cfg(feature = "compression-gzip")]
    {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::with_capacity(_raw.len() / 2 + 64), Compression::default());
        encoder.write_all(_raw)?;
        return encoder.finish();
    }

    #[cfg(not(feature = "compression-gzip"))]
    {
        Err(io::Error::other("gzip compression support not enabled (enable feature `compression-gzip`)"))
    }
}

fn decompress_gzip(_payload: &[u8], _out: &mut Vec<u8>) -> io::Result<()> {
    #[cfg(feature = "compression-gzip")]
    {
        use flate2::read::GzDecoder;
        use std::io::Read;

        // gzip carries its own end marker, so the stream is read to completion
        // and the length is checked afterwards
        let mut decoder = GzDecoder::new(_payload);
        decoder.read_to_end(_out)?;
        return Ok(());
    }

    #[cfg(not(feature = "compression-gzip"))]
    {
        Err(io::Error::other("gzip decompression support not enabled (enable feature `compression-gzip`)"))
    }
}
