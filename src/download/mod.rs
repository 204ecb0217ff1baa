// src/download/mod.rs

//! Caching download client
//!
//! Downloads binary packages from configured mirrors into the package cache
//! directory before they are parsed. Downloads run concurrently (bounded);
//! per-package failures are recorded on the entry instead of failing the
//! whole session.

use crate::actions::AbortHandle;
use crate::error::{Error, Result};
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::debug;

/// How many downloads are in flight at once
const MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// One queued download of a package into the cache
#[derive(Debug, Clone)]
pub struct PackageCachingEntry {
    /// Database and package the download belongs to, for error reporting
    pub db_name: String,
    pub package_name: String,
    pub url: String,
    pub destination: PathBuf,
    pub error: Option<String>,
}

impl PackageCachingEntry {
    pub fn new(
        db_name: impl Into<String>,
        package_name: impl Into<String>,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            package_name: package_name.into(),
            url: url.into(),
            destination: destination.into(),
            error: None,
        }
    }
}

/// Download all queued entries, recording per-entry errors
///
/// Honors the abort flag between downloads; entries skipped due to an abort
/// are marked with an error so later phases do not parse half-written files.
pub async fn cache_packages(entries: &mut [PackageCachingEntry], abort: &AbortHandle) {
    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            for entry in entries.iter_mut() {
                entry.error = Some(format!("unable to create HTTP client: {e}"));
            }
            return;
        }
    };

    let mut join_set: JoinSet<(usize, Option<String>)> = JoinSet::new();
    let mut next_index = 0usize;
    loop {
        while join_set.len() < MAX_CONCURRENT_DOWNLOADS && next_index < entries.len() {
            let index = next_index;
            next_index += 1;
            if abort.is_aborted() {
                entries[index].error = Some("download aborted".to_string());
                continue;
            }
            let client = client.clone();
            let url = entries[index].url.clone();
            let destination = entries[index].destination.clone();
            join_set.spawn(async move {
                let error = download_file(&client, &url, &destination)
                    .await
                    .err()
                    .map(|e| e.to_string());
                (index, error)
            });
        }
        match join_set.join_next().await {
            Some(Ok((index, error))) => {
                if let Some(error) = &error {
                    debug!("download of {} failed: {error}", entries[index].url);
                }
                entries[index].error = error;
            }
            Some(Err(e)) => debug!("download task failed: {e}"),
            None => break,
        }
    }
}

async fn download_file(
    client: &reqwest::Client,
    url: &str,
    destination: &std::path::Path,
) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Io(format!("unable to create cache directory: {e}")))?;
    }
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Io(format!("unable to request {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Io(format!(
            "mirror returned HTTP status {} for {url}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Io(format!("unable to read response of {url}: {e}")))?;
    tokio::fs::write(destination, &bytes)
        .await
        .map_err(|e| Error::Io(format!("unable to write {}: {e}", destination.display())))?;
    debug!("cached {url} at {}", destination.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aborted_session_marks_entries() {
        let abort = AbortHandle::default();
        abort.abort();
        let mut entries = vec![PackageCachingEntry::new(
            "core",
            "zstd",
            "https://mirror.invalid/zstd.pkg.tar.zst",
            "/tmp/zstd.pkg.tar.zst",
        )];
        cache_packages(&mut entries, &abort).await;
        assert_eq!(entries[0].error.as_deref(), Some("download aborted"));
    }

    #[tokio::test]
    async fn test_unresolvable_mirror_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortHandle::default();
        let mut entries = vec![PackageCachingEntry::new(
            "core",
            "zstd",
            "http://mirror.invalid./zstd.pkg.tar.zst",
            dir.path().join("zstd.pkg.tar.zst"),
        )];
        cache_packages(&mut entries, &abort).await;
        assert!(entries[0].error.is_some());
    }
}
