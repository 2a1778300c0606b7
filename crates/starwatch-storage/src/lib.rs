//! Report artifact storage + HTTP client construction for starwatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "starwatch-storage";

/// Settings for the shared outbound HTTP client.
///
/// The enrichment passes issue exactly one attempt per item; the only rate
/// bound is the caller's worker cap, so there is no retry or backoff layer
/// here. The per-request timeout is the only bound on a stuck call.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
}

/// Writes run artifacts under a single output directory and publishes the
/// current artifact to a fixed well-known path for the downstream consumer.
#[derive(Debug, Clone)]
pub struct ReportStore {
    output_dir: PathBuf,
}

impl ReportStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// File name for the dated artifact of one run day.
    pub fn dated_report_name(date: chrono::NaiveDate) -> String {
        format!("result_{}.csv", date.format("%Y-%m-%d"))
    }

    /// Store bytes under `output_dir` using a temp-file write and atomic
    /// rename. Re-running on the same day replaces that day's artifact; a
    /// reader never observes a partially-written file.
    pub async fn store_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredReport> {
        let absolute_path = self.output_dir.join(file_name);
        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating report directory {}", parent.display()))?;
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("report path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        info!(file_name, bytes = bytes.len(), "stored report artifact");
        Ok(StoredReport {
            file_name: file_name.to_string(),
            absolute_path,
            byte_size: bytes.len(),
            sha256: sha256_hex(bytes),
        })
    }

    /// Copy a stored artifact to the fixed well-known path consumed
    /// downstream, creating parent directories as needed.
    pub async fn publish(
        &self,
        stored: &StoredReport,
        publish_path: &Path,
    ) -> anyhow::Result<PathBuf> {
        if let Some(parent) = publish_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating publish directory {}", parent.display()))?;
        }
        fs::copy(&stored.absolute_path, publish_path)
            .await
            .with_context(|| {
                format!(
                    "publishing {} -> {}",
                    stored.absolute_path.display(),
                    publish_path.display()
                )
            })?;
        info!(path = %publish_path.display(), "published report artifact");
        Ok(publish_path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn report_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn dated_report_name_uses_run_date() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 2, 24).unwrap();
        assert_eq!(ReportStore::dated_report_name(date), "result_2026-02-24.csv");
    }

    #[tokio::test]
    async fn store_replaces_same_day_artifact() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());

        let first = store
            .store_bytes("result_2026-02-24.csv", b"first")
            .await
            .expect("first store");
        let second = store
            .store_bytes("result_2026-02-24.csv", b"second")
            .await
            .expect("second store");

        assert_eq!(first.absolute_path, second.absolute_path);
        let on_disk = std::fs::read(&second.absolute_path).expect("read artifact");
        assert_eq!(on_disk, b"second");
        assert_eq!(second.sha256, sha256_hex(b"second"));
    }

    #[tokio::test]
    async fn publish_copies_artifact_to_well_known_path() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path().join("out"));
        let publish_path = dir.path().join("web/public/results/result.csv");

        let stored = store
            .store_bytes("result_2026-02-24.csv", b"a,b\n1,2\n")
            .await
            .expect("store");
        store
            .publish(&stored, &publish_path)
            .await
            .expect("publish");

        let published = std::fs::read(&publish_path).expect("read published copy");
        assert_eq!(published, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn store_leaves_no_temp_files_behind() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        store
            .store_bytes("result_2026-02-24.csv", b"rows")
            .await
            .expect("store");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
