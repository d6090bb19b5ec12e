//! Fetch-and-apply of the next batch of diffs.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use super::importer::Importer;
use super::source::ReplicationSource;
use crate::domain::{LoopParameters, UpdateOutcome};
use crate::error::{Error, Result};
use crate::store::StatusStore;

/// Fetches the next eligible diffs and applies them to the store.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Download, stage and import the next batch, then record the new
    /// replication position in `store`.
    async fn apply<S: StatusStore>(&self, store: &S, params: &LoopParameters) -> Result<UpdateOutcome>;
}

/// Replication client built from a diff source and an import tool.
pub struct Updater<S, I> {
    source: S,
    importer: I,
}

impl<S, I> Updater<S, I>
where
    S: ReplicationSource,
    I: Importer,
{
    pub fn new(source: S, importer: I) -> Self {
        Self { source, importer }
    }

    /// Download diffs from `start` on until `max_bytes` is reached or the
    /// newest published diff has been fetched. Returns the last sequence
    /// fetched and the staged files in apply order.
    async fn download_diffs(
        &self,
        start: u64,
        max_bytes: u64,
        import_file: &Path,
    ) -> Result<Option<(u64, Vec<PathBuf>)>> {
        let Some(newest) = self.source.get_state(None).await? else {
            log::warn!("Cannot get state of the replication service.");
            return Ok(None);
        };

        let mut seq = start;
        let mut total: u64 = 0;
        let mut files = Vec::new();

        while seq <= newest.sequence && total < max_bytes {
            let Some(diff) = self.source.get_diff(seq).await? else {
                log::debug!("Diff {} is not published yet", seq);
                break;
            };
            total += diff.len() as u64;

            let path = staged_path(import_file, seq);
            tokio::fs::write(&path, &diff).await?;
            files.push(path);
            seq += 1;
        }

        if files.is_empty() {
            return Ok(None);
        }

        log::info!(
            "Downloaded {} diff(s) ({} bytes), sequences {} to {}",
            files.len(),
            total,
            start,
            seq - 1
        );
        Ok(Some((seq - 1, files)))
    }
}

/// Staging location of one diff: `<import_file>.<seq>.osc.gz`.
pub fn staged_path(import_file: &Path, seq: u64) -> PathBuf {
    let mut name: OsString = import_file.as_os_str().to_owned();
    name.push(format!(".{}.osc.gz", seq));
    PathBuf::from(name)
}

/// Remove the staged change file and any diffs staged next to it.
pub fn clear_staged(import_file: &Path) -> Result<()> {
    if import_file.exists() {
        std::fs::remove_file(import_file)?;
    }

    let Some(file_name) = import_file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(());
    };
    let dir = match import_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.is_dir() {
        return Ok(());
    }

    let prefix = format!("{}.", file_name);
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".osc.gz") {
            std::fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

#[async_trait]
impl<S, I> ReplicationClient for Updater<S, I>
where
    S: ReplicationSource,
    I: Importer,
{
    async fn apply<St: StatusStore>(&self, store: &St, params: &LoopParameters) -> Result<UpdateOutcome> {
        let status = store.get_status()?;
        let Some(start_seq) = status.sequence_id else {
            log::error!("Replication not set up. Please run 'georepl init'.");
            return Err(Error::Usage("Replication not set up.".to_string()));
        };

        if !status.indexed && params.indexed_only {
            log::info!("Skipping update. There is data that needs indexing.");
            return Ok(UpdateOutcome::MorePending);
        }

        if let Some(batch_date) = status.batch_date {
            let age = Utc::now().signed_duration_since(batch_date);
            let interval = TimeDelta::from_std(params.update_interval).unwrap_or(TimeDelta::MAX);
            if age < interval {
                log::info!(
                    "Last batch is {}s old, next diff is due after {}s.",
                    age.num_seconds(),
                    interval.num_seconds()
                );
                return Ok(UpdateOutcome::NoChanges);
            }
        }

        clear_staged(&params.import_file)?;

        let Some((end_seq, files)) = self
            .download_diffs(start_seq + 1, params.max_diff_bytes(), &params.import_file)
            .await?
        else {
            return Ok(UpdateOutcome::NoChanges);
        };

        self.importer.import(&files, params).await?;

        let end_state = self.source.get_state(Some(end_seq)).await?;
        store.set_status(end_state.map(|s| s.timestamp), Some(end_seq), false)?;

        Ok(UpdateOutcome::UpToDate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StatusRecord;
    use crate::domain::params::test_params;
    use crate::replication::source::ReplicationState;
    use crate::store::{Connector, MemoryConnector};
    use chrono::{DateTime, Duration, TimeZone};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MockSource {
        newest: Option<u64>,
        diffs: HashMap<u64, Vec<u8>>,
    }

    fn seq_time(seq: u64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(seq as i64)
    }

    impl MockSource {
        fn new(newest: u64, published: &[(u64, usize)]) -> Self {
            Self {
                newest: Some(newest),
                diffs: published.iter().map(|(seq, size)| (*seq, vec![b'x'; *size])).collect(),
            }
        }
    }

    #[async_trait]
    impl ReplicationSource for MockSource {
        async fn get_state(&self, seq: Option<u64>) -> Result<Option<ReplicationState>> {
            let Some(newest) = self.newest else {
                return Ok(None);
            };
            let seq = seq.unwrap_or(newest);
            Ok(Some(ReplicationState {
                sequence: seq,
                timestamp: seq_time(seq),
            }))
        }

        async fn get_diff(&self, seq: u64) -> Result<Option<Vec<u8>>> {
            Ok(self.diffs.get(&seq).cloned())
        }
    }

    #[derive(Default)]
    struct RecordingImporter {
        calls: Mutex<Vec<Vec<PathBuf>>>,
        fail: bool,
    }

    #[async_trait]
    impl Importer for RecordingImporter {
        async fn import(&self, files: &[PathBuf], _params: &LoopParameters) -> Result<()> {
            self.calls.lock().unwrap().push(files.to_vec());
            if self.fail {
                return Err(Error::Import("boom".to_string()));
            }
            Ok(())
        }
    }

    fn params_in(dir: &TempDir) -> LoopParameters {
        let mut params = test_params();
        params.import_file = dir.path().join("osmosischange.osc");
        params
    }

    fn status(seq: u64, indexed: bool) -> StatusRecord {
        StatusRecord {
            batch_date: Some(seq_time(seq)),
            sequence_id: Some(seq),
            indexed,
        }
    }

    #[tokio::test]
    async fn test_not_initialised_is_usage_error() {
        let temp = TempDir::new().unwrap();
        let updater = Updater::new(MockSource::new(10, &[]), RecordingImporter::default());
        let store = MemoryConnector::new().connect().unwrap();

        let err = updater.apply(&store, &params_in(&temp)).await.unwrap_err();
        assert!(err.is_usage());
    }

    #[tokio::test]
    async fn test_unindexed_data_returns_more_pending() {
        let temp = TempDir::new().unwrap();
        let importer = RecordingImporter::default();
        let updater = Updater::new(MockSource::new(10, &[(6, 10)]), importer);
        let store = MemoryConnector::with_status(status(5, false)).connect().unwrap();

        let outcome = updater.apply(&store, &params_in(&temp)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::MorePending);
        assert!(updater.importer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unindexed_data_applied_when_not_indexed_only() {
        let temp = TempDir::new().unwrap();
        let updater = Updater::new(MockSource::new(6, &[(6, 10)]), RecordingImporter::default());
        let store = MemoryConnector::with_status(status(5, false)).connect().unwrap();
        let mut params = params_in(&temp);
        params.indexed_only = false;

        let outcome = updater.apply(&store, &params).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_recent_batch_returns_no_changes() {
        let temp = TempDir::new().unwrap();
        let updater = Updater::new(MockSource::new(10, &[(6, 10)]), RecordingImporter::default());
        let recent = StatusRecord {
            batch_date: Some(Utc::now() - Duration::seconds(10)),
            sequence_id: Some(5),
            indexed: true,
        };
        let store = MemoryConnector::with_status(recent).connect().unwrap();

        let outcome = updater.apply(&store, &params_in(&temp)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::NoChanges);
        assert!(updater.importer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_published_returns_no_changes() {
        let temp = TempDir::new().unwrap();
        let updater = Updater::new(MockSource::new(5, &[]), RecordingImporter::default());
        let connector = MemoryConnector::with_status(status(5, true));
        let store = connector.connect().unwrap();

        let outcome = updater.apply(&store, &params_in(&temp)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::NoChanges);
        assert_eq!(store.get_status().unwrap(), status(5, true));
    }

    #[tokio::test]
    async fn test_unreachable_service_returns_no_changes() {
        let temp = TempDir::new().unwrap();
        let source = MockSource {
            newest: None,
            diffs: HashMap::new(),
        };
        let updater = Updater::new(source, RecordingImporter::default());
        let store = MemoryConnector::with_status(status(5, true)).connect().unwrap();

        let outcome = updater.apply(&store, &params_in(&temp)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::NoChanges);
    }

    #[tokio::test]
    async fn test_applies_diffs_and_records_position() {
        let temp = TempDir::new().unwrap();
        let updater = Updater::new(
            MockSource::new(8, &[(6, 10), (7, 10), (8, 10)]),
            RecordingImporter::default(),
        );
        let store = MemoryConnector::with_status(status(5, true)).connect().unwrap();
        let params = params_in(&temp);

        let outcome = updater.apply(&store, &params).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::UpToDate);

        let calls = updater.importer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            vec![
                staged_path(&params.import_file, 6),
                staged_path(&params.import_file, 7),
                staged_path(&params.import_file, 8),
            ]
        );
        assert!(calls[0].iter().all(|f| f.exists()));

        let status = store.get_status().unwrap();
        assert_eq!(status.sequence_id, Some(8));
        assert_eq!(status.batch_date, Some(seq_time(8)));
        assert!(!status.indexed);
    }

    #[tokio::test]
    async fn test_max_diff_size_bounds_download() {
        let temp = TempDir::new().unwrap();
        let big = 600 * 1024;
        let updater = Updater::new(
            MockSource::new(9, &[(6, big), (7, big), (8, big), (9, big)]),
            RecordingImporter::default(),
        );
        let store = MemoryConnector::with_status(status(5, true)).connect().unwrap();
        let mut params = params_in(&temp);
        params.max_diff_size_mb = 1;

        updater.apply(&store, &params).await.unwrap();

        assert_eq!(updater.importer.calls.lock().unwrap()[0].len(), 2);
        assert_eq!(store.get_status().unwrap().sequence_id, Some(7));
    }

    #[tokio::test]
    async fn test_import_failure_leaves_status_untouched() {
        let temp = TempDir::new().unwrap();
        let importer = RecordingImporter {
            fail: true,
            ..Default::default()
        };
        let updater = Updater::new(MockSource::new(6, &[(6, 10)]), importer);
        let store = MemoryConnector::with_status(status(5, true)).connect().unwrap();

        let err = updater.apply(&store, &params_in(&temp)).await.unwrap_err();
        assert!(matches!(err, Error::Import(_)));
        assert_eq!(store.get_status().unwrap(), status(5, true));
    }

    #[test]
    fn test_clear_staged() {
        let temp = TempDir::new().unwrap();
        let import_file = temp.path().join("osmosischange.osc");
        std::fs::write(&import_file, b"old").unwrap();
        std::fs::write(staged_path(&import_file, 1), b"old").unwrap();
        std::fs::write(staged_path(&import_file, 2), b"old").unwrap();
        std::fs::write(temp.path().join("keep.osc.gz"), b"keep").unwrap();

        clear_staged(&import_file).unwrap();

        let left: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, vec!["keep.osc.gz".to_string()]);
    }

    #[test]
    fn test_staged_path() {
        let path = staged_path(Path::new("/data/osmosischange.osc"), 42);
        assert_eq!(path, PathBuf::from("/data/osmosischange.osc.42.osc.gz"));
    }
}
