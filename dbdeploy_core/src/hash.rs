//! SHA-256 checksum manifests.
//!
//! A manifest has one line per file, `<lowercase-hex-digest> *<relative-path>`,
//! the binary-mode layout understood by `sha256sum -c`. Lines starting with `#`
//! and blank lines are ignored when parsing.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// Marker separating the digest from the path in a manifest line.
pub const BINARY_MODE_MARKER: char = '*';

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Errors raised while hashing files or verifying a manifest.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// A file listed in the manifest could not be read.
    #[error("Unable to read {path}: {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A manifest line could not be parsed.
    #[error("Malformed checksum entry on line {line}: '{entry}'")]
    MalformedEntry {
        /// One-based line number.
        line: usize,
        /// The offending line.
        entry: String,
    },

    /// The digest of an extracted file differs from the recorded one.
    #[error("Checksum for {path} does not match. Expected: {expected}, Actual: {actual}")]
    Mismatch {
        /// Path of the file, relative to the verified root.
        path: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest computed from the file on disk.
        actual: String,
    },
}

/// One parsed manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    /// Lowercase hex SHA-256 digest.
    pub digest: String,
    /// Path relative to the manifest root, `/` separated.
    pub path: String,
}

impl ChecksumEntry {
    /// Formats the entry as a manifest line (without the line terminator).
    pub fn to_line(&self) -> String {
        format!("{} {}{}", self.digest, BINARY_MODE_MARKER, self.path)
    }
}

/// Streaming SHA-256 of everything `reader` yields, as lowercase hex.
pub fn digest_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a file on disk.
pub fn digest_file(path: &Path) -> Result<String, HashError> {
    let io_error = |source| HashError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_error)?;
    digest_reader(&mut file).map_err(io_error)
}

/// Parses a manifest into its entries.
///
/// The digest is the text before the first whitespace and the path is the text
/// after the binary-mode marker.
pub fn parse_manifest(manifest: &str) -> Result<Vec<ChecksumEntry>, HashError> {
    let mut entries = Vec::new();
    for (index, raw) in manifest.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || HashError::MalformedEntry {
            line: index + 1,
            entry: line.to_string(),
        };
        let digest = line
            .split_whitespace()
            .next()
            .ok_or_else(malformed)?
            .to_ascii_lowercase();
        let (_, path) = line
            .split_once(BINARY_MODE_MARKER)
            .ok_or_else(malformed)?;
        if hex::decode(&digest).is_err() || path.is_empty() || !is_relative_inside(path) {
            return Err(malformed());
        }
        entries.push(ChecksumEntry {
            digest,
            path: path.to_string(),
        });
    }
    Ok(entries)
}

/// Verifies every entry of `manifest` against the files below `root`.
///
/// Returns the number of verified files. Files present on disk but absent from
/// the manifest are not checked.
pub fn verify_manifest(root: &Path, manifest: &str) -> Result<usize, HashError> {
    let entries = parse_manifest(manifest)?;
    for entry in &entries {
        let actual = digest_file(&root.join(&entry.path))?;
        if actual != entry.digest {
            return Err(HashError::Mismatch {
                path: entry.path.clone(),
                expected: entry.digest.clone(),
                actual,
            });
        }
        log::trace!("Checksum verified for {}", entry.path);
    }
    log::debug!("Verified {} checksums below {}", entries.len(), root.display());
    Ok(entries.len())
}

fn is_relative_inside(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
