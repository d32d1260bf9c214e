//! Transparent decompression of layer blobs.
//!
//! Layer blobs inside an archive may be stored plain or compressed. The
//! compression is detected from the first bytes of the blob, never from the
//! file name.

use std::io::{self, Read};

use crate::intake::{Replay, read_prefix};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

/// Longest magic number we look for.
const MAX_MAGIC_LEN: usize = 6;

/// Compression detected on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Not compressed.
    None,
    /// gzip, possibly multi-member.
    Gzip,
    /// Zstandard.
    Zstd,
    /// bzip2 (recognized, not supported).
    Bzip2,
    /// xz (recognized, not supported).
    Xz,
}

impl Compression {
    /// Detect the compression from the leading bytes of a stream.
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if prefix.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else if prefix.starts_with(BZIP2_MAGIC) {
            Self::Bzip2
        } else if prefix.starts_with(XZ_MAGIC) {
            Self::Xz
        } else {
            Self::None
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
        }
    }
}

/// Wrap `src` in a decoder matching its detected compression.
///
/// The returned reader yields the uncompressed bytes from the start of the
/// stream. Unsupported formats fail with [`io::ErrorKind::Unsupported`].
pub fn decompress_stream<'a, R: Read + 'a>(mut src: R) -> io::Result<Box<dyn Read + 'a>> {
    let prefix = read_prefix(&mut src, MAX_MAGIC_LEN)?;
    let compression = Compression::detect(&prefix);
    tracing::debug!("layer compression: {}", compression.name());
    let replay: Replay<R> = io::Cursor::new(prefix).chain(src);
    let r: Box<dyn Read + 'a> = match compression {
        Compression::None => Box::new(replay),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(replay)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(replay)?),
        c @ (Compression::Bzip2 | Compression::Xz) => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported compression format {}", c.name()),
            ));
        }
    };
    Ok(r)
}
