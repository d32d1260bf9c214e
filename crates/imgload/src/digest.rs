//! Content addressing for layers and images.
//!
//! Every piece of content the loader handles is identified by a SHA-256
//! digest in `sha256:<hex>` form. Three identities are derived from it:
//!
//! - [`DiffId`]: the digest of one layer's uncompressed tar stream.
//! - [`ChainId`]: the digest of an ordered stack of diff IDs. For a single
//!   layer the chain ID equals its diff ID; every further layer hashes the
//!   previous chain ID, a space, and the new diff ID.
//! - [`ImageId`]: the digest of an image's config blob.
//!
//! # Example
//!
//! ```
//! use imgload::digest::{DiffId, chain_id};
//!
//! let base = DiffId::from_content(b"base layer");
//! let top = DiffId::from_content(b"top layer");
//!
//! // A one-layer chain is identified by its diff ID.
//! assert_eq!(chain_id(&[base.clone()]).unwrap().as_str(), base.as_str());
//!
//! // Order matters.
//! assert_ne!(
//!     chain_id(&[base.clone(), top.clone()]),
//!     chain_id(&[top, base]),
//! );
//! ```

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::StorageError;

const SHA256_PREFIX: &str = "sha256:";

/// A validated `sha256:<64 hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        let hex = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| StorageError::InvalidDigest(s.to_string()))?;
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(StorageError::InvalidDigest(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Digest of an in-memory byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{SHA256_PREFIX}{:x}", hasher.finalize()))
    }

    /// The full `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex portion without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

macro_rules! digest_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Digest);

        impl $name {
            /// Wrap an already validated digest.
            pub fn new(digest: Digest) -> Self {
                Self(digest)
            }

            /// Parse and validate a digest string.
            pub fn parse(s: &str) -> Result<Self, StorageError> {
                Digest::parse(s).map(Self)
            }

            /// The underlying digest.
            pub fn digest(&self) -> &Digest {
                &self.0
            }

            /// The full `sha256:<hex>` form.
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            /// The hex portion without the algorithm prefix.
            pub fn hex(&self) -> &str {
                self.0.hex()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

digest_newtype!(
    /// Content hash of one layer's uncompressed filesystem delta.
    DiffId
);
digest_newtype!(
    /// Content hash identifying an ordered stack of layers.
    ChainId
);
digest_newtype!(
    /// Identity of an image, the digest of its config blob.
    ImageId
);

impl DiffId {
    /// Diff ID of an in-memory layer stream.
    pub fn from_content(data: &[u8]) -> Self {
        Self(Digest::from_bytes(data))
    }
}

impl ChainId {
    /// The chain ID of this stack with one more layer on top.
    pub fn extend(&self, diff_id: &DiffId) -> ChainId {
        ChainId(Digest::from_bytes(format!("{self} {diff_id}").as_bytes()))
    }
}

impl From<DiffId> for ChainId {
    /// A single-layer stack is identified by the layer's diff ID.
    fn from(diff_id: DiffId) -> Self {
        ChainId(diff_id.0)
    }
}

/// Compute the chain ID of an ordered sequence of diff IDs.
///
/// Returns `None` for an empty sequence.
pub fn chain_id(diff_ids: &[DiffId]) -> Option<ChainId> {
    let (first, rest) = diff_ids.split_first()?;
    let base = ChainId::from(first.clone());
    Some(rest.iter().fold(base, |chain, diff| chain.extend(diff)))
}

/// Compute the diff ID of a layer stream without buffering it.
pub fn compute_diff_id<R: Read>(mut reader: R) -> io::Result<DiffId> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(DiffId(Digest::from_hasher(hasher)))
}

/// A reader adapter that hashes everything read through it.
///
/// This lets a consumer (for example a tar unpacker) read a layer stream
/// once while its diff ID is computed on the side.
#[derive(Debug)]
pub struct DiffIdReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> DiffIdReader<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Read the remainder of the stream and return its diff ID and length.
    ///
    /// Consumers like tar readers may stop before the end of the stream
    /// (trailing padding); draining keeps the hash over the full content.
    pub fn finish(mut self) -> io::Result<(DiffId, u64)> {
        io::copy(&mut self, &mut io::sink())?;
        Ok((DiffId(Digest::from_hasher(self.hasher)), self.bytes))
    }
}

impl<R: Read> Read for DiffIdReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// A claimed content identity did not match the actual content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {:?}, got {:?}", .expected.as_str(), .actual.as_str())]
pub struct DigestMismatch {
    /// The identity claimed by the archive metadata.
    pub expected: DiffId,
    /// The identity computed from the content.
    pub actual: DiffId,
}

/// Check that the actual diff ID of a layer equals the claimed one.
pub fn verify(expected: &DiffId, actual: &DiffId) -> Result<(), DigestMismatch> {
    if expected == actual {
        Ok(())
    } else {
        Err(DigestMismatch {
            expected: expected.clone(),
            actual: actual.clone(),
        })
    }
}
