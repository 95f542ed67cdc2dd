//! Block compression algorithms.
//!
//! The algorithm of every block is recorded in its header as a `u16` tag.
//! Tags are permanent; a retired algorithm keeps its number.
//!
//! | Tag | Codec  |
//! | --: | ------ |
//! | 0   | none   |
//! | 1   | zstd   |
//! | 2   | lz4    |
//! | 3   | brotli |
//! | 4   | lzma   |

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Unknown compression algorithm tag {0}")]
    UnknownAlgorithm(u16),
    #[error("Decompressed {actual} bytes, block declares {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CodecId {
    None = 0,
    Zstd = 1,
    Lz4 = 2,
    Brotli = 3,
    Lzma = 4,
}

impl CodecId {
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(CodecId::None),
            1 => Ok(CodecId::Zstd),
            2 => Ok(CodecId::Lz4),
            3 => Ok(CodecId::Brotli),
            4 => Ok(CodecId::Lzma),
            other => Err(CodecError::UnknownAlgorithm(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Zstd => "zstd",
            CodecId::Lz4 => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma => "lzma",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CodecId::None),
            "zstd" => Some(CodecId::Zstd),
            "lz4" => Some(CodecId::Lz4),
            "brotli" => Some(CodecId::Brotli),
            "lzma" => Some(CodecId::Lzma),
            _ => None,
        }
    }

    /// Compress `data`.  `level` is interpreted per codec (zstd 1-19,
    /// brotli 0-11) and ignored by the others.
    pub fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecId::None => Ok(data.to_vec()),
            CodecId::Zstd => {
                zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
            }
            CodecId::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CodecId::Brotli => {
                let mut out = Vec::new();
                {
                    let quality = level.clamp(0, 11) as u32;
                    let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
                    w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
                }
                Ok(out)
            }
            CodecId::Lzma => {
                let mut out = Vec::new();
                lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
                    .map_err(|e| CodecError::Compression(e.to_string()))?;
                Ok(out)
            }
        }
    }

    /// Decompress `data` and check the result is exactly `expected_len`
    /// bytes long.  Output is never allowed to grow past `expected_len + 1`
    /// bytes, whatever the compressed stream claims.
    pub fn decompress(self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let limit = expected_len as u64 + 1;
        let out = match self {
            CodecId::None => data.to_vec(),
            CodecId::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(data)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                read_bounded(decoder, limit, expected_len)?
            }
            CodecId::Lz4 => {
                if data.len() < 4 {
                    let msg = "lz4 block shorter than its size prefix";
                    return Err(CodecError::Decompression(msg.into()));
                }
                let declared = LittleEndian::read_u32(&data[..4]) as usize;
                if declared != expected_len {
                    let (expected, actual) = (expected_len, declared);
                    return Err(CodecError::SizeMismatch { expected, actual });
                }
                lz4_flex::decompress(&data[4..], expected_len)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?
            }
            CodecId::Brotli => {
                read_bounded(brotli::Decompressor::new(data, 4096), limit, expected_len)?
            }
            CodecId::Lzma => {
                let limit = limit as usize;
                let mut sink = BoundedSink { buf: Vec::with_capacity(expected_len), limit };
                let options =
                    lzma_rs::decompress::Options { memlimit: Some(limit), ..Default::default() };
                let mut input = io::Cursor::new(data);
                lzma_rs::lzma_decompress_with_options(&mut input, &mut sink, &options)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                sink.buf
            }
        };
        if out.len() != expected_len {
            return Err(CodecError::SizeMismatch { expected: expected_len, actual: out.len() });
        }
        Ok(out)
    }
}

fn read_bounded<R: Read>(
    reader: R,
    limit: u64,
    expected_len: usize,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(expected_len);
    reader
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

/// Write target that refuses to grow past `limit` bytes.
struct BoundedSink {
    buf:   Vec<u8>,
    limit: usize,
}

impl Write for BoundedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            let msg = "decompressed data exceeds the block size";
            return Err(io::Error::new(io::ErrorKind::Other, msg));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
