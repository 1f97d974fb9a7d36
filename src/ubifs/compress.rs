//! Decompression codecs, looked up by the on-disk compression type.
//!
//! UBIFS tags every data node (and compressed inline data) with a
//! compressor id. Codecs are dispatched here so a missing or unknown one
//! degrades to an error the caller can turn into a warning, never a
//! panic. The zlib variant is raw deflate: UBIFS stores no zlib header.

use std::io::Read;

use thiserror::Error;

use crate::ubifs::lzo::{self, LzoError};

/// Compressor id stored in data nodes and inodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComprType {
    None,
    Lzo,
    Zlib,
    Zstd,
    Unknown(u16),
}

impl ComprType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Lzo,
            2 => Self::Zlib,
            3 => Self::Zstd,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no codec for compression type {0}")]
    Missing(u16),

    #[error("lzo: {0}")]
    Lzo(#[from] LzoError),

    #[error("deflate: {0}")]
    Inflate(std::io::Error),

    #[error("zstd: {0}")]
    Zstd(std::io::Error),

    #[error("decompressed to {got} bytes, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },
}

/// Decompresses `data` and checks the result is exactly `out_len` bytes.
///
/// `out_len` is known ahead of time for every UBIFS payload (the data
/// node's `size`, or the inode's `size` for inline data), so a length
/// mismatch is corruption, not a caller bug.
pub fn decompress(compr: ComprType, data: &[u8], out_len: usize) -> Result<Vec<u8>, CodecError> {
    let out = match compr {
        ComprType::None => data.to_vec(),
        ComprType::Lzo => lzo::decompress(data, out_len)?,
        ComprType::Zlib => {
            let mut out = Vec::with_capacity(out_len);
            flate2::read::DeflateDecoder::new(data)
                .take(out_len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(CodecError::Inflate)?;
            out
        }
        ComprType::Zstd => zstd::stream::decode_all(data).map_err(CodecError::Zstd)?,
        ComprType::Unknown(raw) => return Err(CodecError::Missing(raw)),
    };

    if out.len() != out_len {
        return Err(CodecError::LengthMismatch {
            got: out.len(),
            expected: out_len,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn raw_deflate_round_trips() {
        let body = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&body).unwrap();
        let packed = encoder.finish().unwrap();

        assert_eq!(decompress(ComprType::Zlib, &packed, body.len()).unwrap(), body);
    }

    #[test]
    fn zstd_round_trips() {
        let body = vec![0x42u8; 4096];
        let packed = zstd::stream::encode_all(&body[..], 0).unwrap();

        assert_eq!(decompress(ComprType::Zstd, &packed, body.len()).unwrap(), body);
    }

    #[test]
    fn unknown_codec_is_an_error_not_a_panic() {
        assert!(matches!(
            decompress(ComprType::Unknown(9), &[1, 2, 3], 3),
            Err(CodecError::Missing(9))
        ));
    }

    #[test]
    fn length_mismatch_is_reported() {
        assert!(matches!(
            decompress(ComprType::None, &[1, 2, 3], 8),
            Err(CodecError::LengthMismatch { got: 3, expected: 8 })
        ));
    }
}
