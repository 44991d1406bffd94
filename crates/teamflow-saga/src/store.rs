use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::{SagaExecutionRecord, SagaStatus};

const SNAPSHOT_EXTENSION: &str = "json";

/// Persistence seam for saga snapshots.
pub trait StateStore: Send + Sync {
    /// Write the snapshot of `record`, replacing any earlier one with the same saga id.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized or written.
    fn save(&self, record: &SagaExecutionRecord) -> Result<(), StoreError>;

    /// Read the snapshot for `saga_id`, or `None` if none was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read or parsed.
    fn load(&self, saga_id: &str) -> Result<Option<SagaExecutionRecord>, StoreError>;

    /// Summaries of every stored snapshot, sorted by saga id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store itself cannot be enumerated.
    fn list(&self) -> Result<Vec<SagaStateSummary>, StoreError>;
}

/// One line of [`list_saga_states`].
///
/// `status` and `timestamp` are `None` when the snapshot could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStateSummary {
    pub saga_id: String,
    pub status: Option<SagaStatus>,
    /// Start time of the run.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Stores each snapshot as pretty-printed `<sagaId>.json` in one directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for `saga_id`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidSagaId` if the id is empty or could
    /// escape the state directory.
    pub fn snapshot_path(&self, saga_id: &str) -> Result<PathBuf, StoreError> {
        validate_saga_id(saga_id)?;
        Ok(self.dir.join(format!("{saga_id}.{SNAPSHOT_EXTENSION}")))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, record: &SagaExecutionRecord) -> Result<(), StoreError> {
        let path = self.snapshot_path(&record.saga_id)?;

        fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let content =
            serde_json::to_string_pretty(record).map_err(|source| StoreError::Serialize {
                saga_id: record.saga_id.clone(),
                source,
            })?;

        fs::write(&path, content).map_err(|source| StoreError::Write { path, source })
    }

    fn load(&self, saga_id: &str) -> Result<Option<SagaExecutionRecord>, StoreError> {
        let path = self.snapshot_path(saga_id)?;

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Parse { path, source })
    }

    fn list(&self) -> Result<Vec<SagaStateSummary>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::ReadDir {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::ReadDir {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let Some(saga_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            summaries.push(summarize(saga_id, &path));
        }

        summaries.sort_by(|a, b| a.saga_id.cmp(&b.saga_id));
        Ok(summaries)
    }
}

/// Fields read when listing; everything else in the snapshot is ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHeader {
    status: Option<SagaStatus>,
    start_time: Option<DateTime<Utc>>,
}

fn summarize(saga_id: &str, path: &Path) -> SagaStateSummary {
    let header = fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str::<SnapshotHeader>(&content).ok());

    SagaStateSummary {
        saga_id: saga_id.to_string(),
        status: header.as_ref().and_then(|h| h.status),
        timestamp: header.and_then(|h| h.start_time),
    }
}

/// A saga id must name exactly one plain file inside the state directory.
fn validate_saga_id(saga_id: &str) -> Result<(), StoreError> {
    let mut components = Path::new(saga_id).components();
    let single_file = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if !single_file || saga_id.contains(['/', '\\']) {
        return Err(StoreError::InvalidSagaId {
            saga_id: saga_id.to_string(),
        });
    }
    Ok(())
}

/// Load the snapshot of `saga_id` from `dir`.
///
/// # Errors
///
/// Returns an error if the id is invalid or the snapshot exists but cannot
/// be read or parsed.
pub fn load_saga_state(
    dir: impl AsRef<Path>,
    saga_id: &str,
) -> Result<Option<SagaExecutionRecord>, StoreError> {
    FileStateStore::new(dir.as_ref()).load(saga_id)
}

/// List snapshot summaries in `dir`. A missing directory yields an empty list.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub fn list_saga_states(dir: impl AsRef<Path>) -> Result<Vec<SagaStateSummary>, StoreError> {
    FileStateStore::new(dir.as_ref()).list()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SagaContext;
    use crate::record::StepExecutionRecord;

    fn sample_record(saga_id: &str) -> SagaExecutionRecord {
        let mut record = SagaExecutionRecord::new(
            saga_id,
            Some("Sample"),
            vec![
                StepExecutionRecord::new("a", "a"),
                StepExecutionRecord::new("b", "b"),
            ],
            SagaContext::new(),
        );
        record.advance(SagaStatus::Running);
        record.start_time = Some(Utc::now());
        record.advance(SagaStatus::Succeeded);
        record
    }

    mod save_and_load {
        use super::*;

        #[test]
        fn round_trips_snapshot() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let store = FileStateStore::new(dir.path());
            let record = sample_record("saga-1");

            store.save(&record)?;
            let loaded = store.load("saga-1")?;

            assert_eq!(loaded, Some(record));
            Ok(())
        }

        #[test]
        fn creates_missing_state_directory() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let nested = dir.path().join("state").join("sagas");
            let store = FileStateStore::new(&nested);

            store.save(&sample_record("saga-1"))?;

            assert!(nested.join("saga-1.json").exists());
            Ok(())
        }

        #[test]
        fn writes_camel_case_pretty_json() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let store = FileStateStore::new(dir.path());

            store.save(&sample_record("saga-1"))?;
            let content = fs::read_to_string(dir.path().join("saga-1.json"))?;

            assert!(content.contains("\"sagaId\": \"saga-1\""));
            assert!(content.contains("\"stepRecords\""));
            assert!(content.contains('\n'));
            Ok(())
        }

        #[test]
        fn missing_snapshot_loads_as_none() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;

            let loaded = load_saga_state(dir.path(), "unknown")?;

            assert!(loaded.is_none());
            Ok(())
        }

        #[test]
        fn corrupt_snapshot_is_parse_error() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            fs::write(dir.path().join("broken.json"), "{ not json")?;

            let err = load_saga_state(dir.path(), "broken").expect_err("should fail");

            assert!(matches!(err, StoreError::Parse { .. }));
            Ok(())
        }

        #[test]
        fn rejects_ids_that_escape_directory() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let store = FileStateStore::new(dir.path());

            for saga_id in ["", ".", "..", "../outside", "a/b", "a\\b", "/etc"] {
                let err = store.load(saga_id).expect_err("should reject");
                assert!(matches!(err, StoreError::InvalidSagaId { .. }), "{saga_id}");
            }
            Ok(())
        }

        #[test]
        fn accepts_ids_with_inner_dots() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let store = FileStateStore::new(dir.path());
            let record = sample_record("release..v2");

            store.save(&record)?;

            assert!(dir.path().join("release..v2.json").exists());
            assert_eq!(store.load("release..v2")?, Some(record));
            Ok(())
        }
    }

    mod listing {
        use super::*;

        #[test]
        fn missing_directory_lists_nothing() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;

            let states = list_saga_states(dir.path().join("absent"))?;

            assert!(states.is_empty());
            Ok(())
        }

        #[test]
        fn lists_snapshots_sorted_with_status_and_start_time() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let store = FileStateStore::new(dir.path());
            let second = sample_record("saga-b");
            let first = sample_record("saga-a");
            store.save(&second)?;
            store.save(&first)?;
            fs::write(dir.path().join("notes.txt"), "ignored")?;

            let states = store.list()?;

            assert_eq!(
                states,
                vec![
                    SagaStateSummary {
                        saga_id: "saga-a".to_string(),
                        status: Some(SagaStatus::Succeeded),
                        timestamp: first.start_time,
                    },
                    SagaStateSummary {
                        saga_id: "saga-b".to_string(),
                        status: Some(SagaStatus::Succeeded),
                        timestamp: second.start_time,
                    },
                ]
            );
            Ok(())
        }

        #[test]
        fn unreadable_snapshot_is_listed_without_status() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            fs::write(dir.path().join("broken.json"), "garbage")?;

            let states = list_saga_states(dir.path())?;

            assert_eq!(
                states,
                vec![SagaStateSummary {
                    saga_id: "broken".to_string(),
                    status: None,
                    timestamp: None,
                }]
            );
            Ok(())
        }
    }
}
