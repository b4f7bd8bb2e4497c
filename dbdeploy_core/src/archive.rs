//! Zip archives of bundle directories.
//!
//! [`zip_directory`] walks a directory tree and writes every file into an
//! in-memory zip under its root-relative path, computing the checksum
//! manifest in the same pass. [`unzip`] restores such an archive below a
//! target directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::hash::ChecksumEntry;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Errors raised while archiving or restoring a directory tree.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// I/O failure on a specific path.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Directory traversal failed.
    #[error("Unable to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    /// The zip container is invalid.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The source of an archive is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    /// An archive entry would be written outside the target directory.
    #[error("Archive entry '{0}' escapes the extraction directory")]
    UnsafeEntry(String),
}

/// A zipped directory tree together with its checksum manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryArchive {
    /// The zip container bytes.
    pub binaries: Vec<u8>,
    /// The manifest, one `<digest> *<path>` line per archived file.
    pub hashes: Vec<u8>,
    /// Number of archived files.
    pub file_count: usize,
}

/// Zips every file below `root`, with entry names relative to `root`.
pub fn zip_directory(root: &Path) -> Result<DirectoryArchive, ArchiveError> {
    if !root.is_dir() {
        return Err(ArchiveError::NotADirectory(root.to_path_buf()));
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut manifest = String::new();
    let mut file_count = 0;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = relative_entry_name(root, path)?;

        zip.start_file(relative.as_str(), options)?;
        let digest = copy_and_digest(path, &mut zip)?;

        manifest.push_str(
            &ChecksumEntry {
                digest,
                path: relative,
            }
            .to_line(),
        );
        manifest.push('\n');
        file_count += 1;
    }

    let binaries = zip.finish()?.into_inner();
    log::debug!(
        "Archived {} files from {} ({} bytes)",
        file_count,
        root.display(),
        binaries.len()
    );

    Ok(DirectoryArchive {
        binaries,
        hashes: manifest.into_bytes(),
        file_count,
    })
}

/// Extracts `binaries` below `target`, creating directories as needed.
///
/// Existing files are never overwritten. Returns the number of extracted files.
pub fn unzip(binaries: &[u8], target: &Path) -> Result<usize, ArchiveError> {
    fs::create_dir_all(target).map_err(|source| ArchiveError::Io {
        path: target.to_path_buf(),
        source,
    })?;

    let mut archive = ZipArchive::new(Cursor::new(binaries))?;
    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let relative = file
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeEntry(file.name().to_string()))?;
        let destination = target.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&destination).map_err(|source| ArchiveError::Io {
                path: destination.clone(),
                source,
            })?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let io_error = |source| ArchiveError::Io {
            path: destination.clone(),
            source,
        };
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
            .map_err(io_error)?;
        io::copy(&mut file, &mut out).map_err(io_error)?;
        extracted += 1;
    }

    log::debug!("Extracted {} files into {}", extracted, target.display());
    Ok(extracted)
}

fn relative_entry_name(root: &Path, path: &Path) -> Result<String, ArchiveError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ArchiveError::UnsafeEntry(path.display().to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn copy_and_digest<W: Write>(path: &Path, out: &mut W) -> Result<String, ArchiveError> {
    let io_error = |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(io_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        out.write_all(&buffer[..read]).map_err(io_error)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{self, HashError};

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bundle.json"), r#"{"name":"sample"}"#).unwrap();
        fs::create_dir_all(dir.path().join("sql/nested")).unwrap();
        fs::write(dir.path().join("sql/001_up.sql"), "CREATE TABLE a (id INT);").unwrap();
        fs::write(dir.path().join("sql/nested/seed.sql"), "INSERT INTO a VALUES (1);").unwrap();
        dir
    }

    #[test]
    fn manifest_lists_relative_paths() {
        let source = sample_tree();
        let archive = zip_directory(source.path()).unwrap();
        assert_eq!(archive.file_count, 3);

        let manifest = String::from_utf8(archive.hashes).unwrap();
        let paths: Vec<String> = hash::parse_manifest(&manifest)
            .unwrap()
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        assert_eq!(
            paths,
            vec!["bundle.json", "sql/001_up.sql", "sql/nested/seed.sql"]
        );
    }

    #[test]
    fn extracted_tree_verifies_against_manifest() {
        let source = sample_tree();
        let archive = zip_directory(source.path()).unwrap();
        let target = tempfile::tempdir().unwrap();

        assert_eq!(unzip(&archive.binaries, target.path()).unwrap(), 3);

        let manifest = String::from_utf8(archive.hashes).unwrap();
        assert_eq!(hash::verify_manifest(target.path(), &manifest).unwrap(), 3);
        assert_eq!(
            fs::read_to_string(target.path().join("sql/nested/seed.sql")).unwrap(),
            "INSERT INTO a VALUES (1);"
        );
    }

    #[test]
    fn corrupted_extraction_is_detected() {
        let source = sample_tree();
        let archive = zip_directory(source.path()).unwrap();
        let target = tempfile::tempdir().unwrap();
        unzip(&archive.binaries, target.path()).unwrap();

        fs::write(target.path().join("sql/001_up.sql"), "DROP TABLE a;").unwrap();
        let manifest = String::from_utf8(archive.hashes).unwrap();
        let err = hash::verify_manifest(target.path(), &manifest).unwrap_err();
        match err {
            HashError::Mismatch { path, .. } => assert_eq!(path, "sql/001_up.sql"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unzip_does_not_overwrite_existing_files() {
        let source = sample_tree();
        let archive = zip_directory(source.path()).unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::write(target.path().join("bundle.json"), "{}").unwrap();

        let err = unzip(&archive.binaries, target.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
    }

    #[test]
    fn zip_requires_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            zip_directory(&file).unwrap_err(),
            ArchiveError::NotADirectory(_)
        ));
    }
}
