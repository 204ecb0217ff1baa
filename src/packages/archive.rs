// src/packages/archive.rs

//! Streaming enumeration of (possibly compressed) tar archives
//!
//! Packages and repository databases are tar archives compressed with zstd,
//! xz or gzip. [`walk_through_archive`] decompresses on the fly and hands
//! every accepted file's content to a callback without extracting to disk.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use xz2::read::XzDecoder;

/// A file taken out of an archive
#[derive(Debug, Clone)]
pub struct ArchiveFile {
    pub name: String,
    pub content: Vec<u8>,
}

enum CompressionFormat {
    Zstd,
    Xz,
    Gzip,
    None,
}

/// Detect compression format from the file extension
fn detect_compression(path: &Path) -> CompressionFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("zst") => CompressionFormat::Zstd,
        Some("xz") => CompressionFormat::Xz,
        Some("gz") => CompressionFormat::Gzip,
        _ => CompressionFormat::None,
    }
}

/// Open and decompress a tar archive
fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(path)
        .map_err(|e| Error::Io(format!("Failed to open archive {}: {e}", path.display())))?;

    let reader: Box<dyn Read> = match detect_compression(path) {
        CompressionFormat::Zstd => Box::new(
            zstd::Decoder::new(file)
                .map_err(|e| Error::Io(format!("Failed to create zstd decoder: {e}")))?,
        ),
        CompressionFormat::Xz => Box::new(XzDecoder::new(file)),
        CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
        CompressionFormat::None => Box::new(file),
    };

    Ok(Archive::new(reader))
}

/// Walk all entries of the archive at `path`
///
/// For every regular file whose `(directory, file name)` passes
/// `file_filter`, `on_file` is invoked with the directory part and the file's
/// full content. `on_dir` is invoked for every directory entry (with the
/// trailing slash removed).
pub fn walk_through_archive(
    path: &Path,
    file_filter: &dyn Fn(&str, &str) -> bool,
    mut on_file: impl FnMut(&str, ArchiveFile),
    mut on_dir: impl FnMut(&str),
) -> Result<()> {
    let mut archive = open_archive(path)?;
    let entries = archive
        .entries()
        .map_err(|e| Error::Parse(format!("Failed to read archive {}: {e}", path.display())))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::Parse(format!("Failed to read archive entry: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::Parse(format!("Failed to read entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let entry_path = entry_path.trim_end_matches('/');

        if entry.header().entry_type().is_dir() {
            on_dir(entry_path);
            continue;
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let (directory, file_name) = match entry_path.rfind('/') {
            Some(pos) => (&entry_path[..pos], &entry_path[pos + 1..]),
            None => ("", entry_path),
        };
        if !file_filter(directory, file_name) {
            continue;
        }

        let mut content = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
        entry
            .read_to_end(&mut content)
            .map_err(|e| Error::Parse(format!("Failed to read \"{entry_path}\": {e}")))?;
        on_file(
            directory,
            ArchiveFile {
                name: file_name.to_string(),
                content,
            },
        );
    }

    Ok(())
}

/// Build a small .tar.gz on disk with the given files and directories
///
/// Test helper shared by the parser and database tests.
#[cfg(test)]
pub fn write_test_archive(
    path: &Path,
    dirs: &[&str],
    files: &[(&str, &[u8])],
) -> std::io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let file = File::create(path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for dir in dirs {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_path(format!("{dir}/"))?;
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append(&header, std::io::empty())?;
    }
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(name)?;
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *content)?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_through_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("test-1.0-1-any.pkg.tar.gz");
        write_test_archive(
            &archive_path,
            &["usr", "usr/bin"],
            &[
                (".PKGINFO", b"pkgname = test\n"),
                ("usr/bin/test", b"#!/bin/sh\n"),
            ],
        )
        .unwrap();

        let mut seen_files = Vec::new();
        let mut seen_dirs = Vec::new();
        walk_through_archive(
            &archive_path,
            &|_dir, _name| true,
            |directory, file| {
                seen_files.push((directory.to_string(), file.name.clone(), file.content.len()));
            },
            |directory| seen_dirs.push(directory.to_string()),
        )
        .unwrap();

        assert_eq!(seen_dirs, vec!["usr", "usr/bin"]);
        assert_eq!(seen_files.len(), 2);
        assert_eq!(seen_files[0].0, "");
        assert_eq!(seen_files[0].1, ".PKGINFO");
        assert_eq!(seen_files[1].0, "usr/bin");
        assert_eq!(seen_files[1].1, "test");
        assert_eq!(seen_files[1].2, 10);
    }

    #[test]
    fn test_filter_skips_content() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("test.tar.gz");
        write_test_archive(
            &archive_path,
            &[],
            &[(".PKGINFO", b"pkgname = test\n"), (".MTREE", b"ignored")],
        )
        .unwrap();

        let mut seen = Vec::new();
        walk_through_archive(
            &archive_path,
            &|_dir, name| name == ".PKGINFO",
            |_, file| seen.push(file.name),
            |_| {},
        )
        .unwrap();
        assert_eq!(seen, vec![".PKGINFO"]);
    }

    #[test]
    fn test_missing_archive_is_io_error() {
        let err = walk_through_archive(Path::new("/nonexistent.tar"), &|_, _| true, |_, _| {}, |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
