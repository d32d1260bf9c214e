//! Archive intake: format sniffing and the scratch directory.
//!
//! The input stream is never seekable. Its first four bytes are read to pick
//! a loader and then replayed in front of the rest of the stream, so the
//! chosen loader sees the input from byte 0.
//!
//! Structured archives are unpacked into a [`ScratchDir`]. Every later access
//! to the unpacked files goes through a [`cap_std::fs::Dir`] handle on the
//! scratch root: paths taken from archive metadata (manifest entries, legacy
//! directory names) cannot reach outside of it, whether through `..`
//! components or through symlinks planted in the archive.

use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::{Dir, File};
use tempfile::TempDir;

use crate::error::LoadError;

/// Magic number at the start of a single-blob (squashfs) image.
pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";

const SCRATCH_PREFIX: &str = "imgload-import-";

/// A stream whose already consumed prefix is replayed before the rest.
pub type Replay<R> = io::Chain<Cursor<Vec<u8>>, R>;

/// The two kinds of input the loader accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// A single filesystem image blob.
    SingleBlob,
    /// A tar archive, with or without a manifest.
    Structured,
}

/// Read up to `len` bytes, stopping early only at end of stream.
pub(crate) fn read_prefix<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut prefix = Vec::with_capacity(len);
    reader.by_ref().take(len as u64).read_to_end(&mut prefix)?;
    Ok(prefix)
}

/// Classify the input and hand back a stream that starts from byte 0.
///
/// An input shorter than four bytes is an [`io::ErrorKind::UnexpectedEof`]
/// error.
pub fn sniff<R: Read>(mut input: R) -> io::Result<(ArchiveFormat, Replay<R>)> {
    let prefix = read_prefix(&mut input, SQUASHFS_MAGIC.len())?;
    if prefix.len() < SQUASHFS_MAGIC.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "archive is shorter than its format header",
        ));
    }
    let format = if prefix == SQUASHFS_MAGIC {
        ArchiveFormat::SingleBlob
    } else {
        ArchiveFormat::Structured
    };
    Ok((format, Cursor::new(prefix).chain(input)))
}

/// Resolve an archive-relative path lexically, rejecting escapes.
///
/// Leading `/` is ignored, so absolute paths are taken relative to the
/// archive root.
pub fn confine(path: &str) -> Result<PathBuf, LoadError> {
    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(c) => clean.push(c),
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(LoadError::PathEscape(PathBuf::from(path)));
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(clean)
}

/// A temporary directory holding one unpacked archive.
///
/// The directory and everything below it is removed when this value is
/// dropped.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Dir,
    // Dropped after `dir`.
    temp: TempDir,
}

impl ScratchDir {
    /// Create a scratch directory under `parent`, or the system temporary
    /// directory when `None`.
    pub fn new(parent: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let temp = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        let dir = Dir::open_ambient_dir(temp.path(), ambient_authority())?;
        Ok(Self { dir, temp })
    }

    /// Host path of the scratch root.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Capability handle on the scratch root.
    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// Unpack a tar stream into the scratch root.
    pub fn unpack<R: Read>(&self, input: R) -> io::Result<()> {
        let mut archive = tar::Archive::new(input);
        archive.set_preserve_mtime(true);
        archive.unpack(self.temp.path())
    }

    /// Open an archive-relative file for reading.
    pub fn open(&self, path: &str) -> Result<File, LoadError> {
        let rel = confine(path)?;
        self.dir.open(&rel).map_err(|e| contained(path, e))
    }

    /// Read an archive-relative file into memory.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, LoadError> {
        let rel = confine(path)?;
        self.dir.read(&rel).map_err(|e| contained(path, e))
    }

    /// Names of the top-level directories, in sorted order.
    pub fn subdirectories(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in self.dir.entries()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// cap-std reports an attempt to leave the directory as permission denied.
fn contained(path: &str, e: io::Error) -> LoadError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        LoadError::PathEscape(PathBuf::from(path))
    } else {
        LoadError::Io(e)
    }
}
