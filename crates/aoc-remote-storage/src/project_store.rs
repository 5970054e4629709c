//! One directory per project under the store root:
//!
//! ```text
//! <root>/<project-id>/project.json       current metadata
//! <root>/<project-id>/project.json.bak   last known-good snapshot
//! <root>/<project-id>/project.json.tmp   in-flight atomic write
//! <root>/<project-id>/logs/              message log segments
//! ```

use crate::StorageError;
use aoc_remote_core::ProjectMetadata;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const METADATA_FILE: &str = "project.json";
pub const BACKUP_FILE: &str = "project.json.bak";
pub const TEMP_FILE: &str = "project.json.tmp";
pub const LOGS_DIR: &str = "logs";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryStrategy {
    RestoreBackup,
    PromoteTempFile,
}

/// Tried in this order; the first strategy that yields valid metadata wins.
pub const RECOVERY_ORDER: [RecoveryStrategy; 2] = [
    RecoveryStrategy::RestoreBackup,
    RecoveryStrategy::PromoteTempFile,
];

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RestoreBackup => "restore_backup",
            RecoveryStrategy::PromoteTempFile => "promote_temp_file",
        }
    }

    fn source_file(&self) -> &'static str {
        match self {
            RecoveryStrategy::RestoreBackup => BACKUP_FILE,
            RecoveryStrategy::PromoteTempFile => TEMP_FILE,
        }
    }

    fn attempt(&self, store: &ProjectStore, id: &str) -> Result<ProjectMetadata, StorageError> {
        let source = store.project_dir(id)?.join(self.source_file());
        let metadata = read_metadata(&source, id)?;
        store.save(&metadata)?;
        Ok(metadata)
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub projects: Vec<ProjectMetadata>,
    pub recovered: Vec<String>,
    pub failed: Vec<(String, StorageError)>,
}

#[derive(Clone, Debug)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_project_id(id)?;
        Ok(self.root.join(id))
    }

    pub fn metadata_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.project_dir(id)?.join(METADATA_FILE))
    }

    pub fn logs_dir(&self, id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.project_dir(id)?.join(LOGS_DIR))
    }

    /// Writes metadata through temp file, fsync, then rename over the live file.
    pub fn save(&self, metadata: &ProjectMetadata) -> Result<(), StorageError> {
        let dir = self.project_dir(&metadata.id)?;
        fs::create_dir_all(&dir)?;
        let payload = serde_json::to_vec_pretty(metadata)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        write_atomic(&dir.join(METADATA_FILE), &dir.join(TEMP_FILE), &payload)?;
        debug!(event = "project_saved", project_id = %metadata.id);
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<ProjectMetadata, StorageError> {
        read_metadata(&self.metadata_path(id)?, id)
    }

    /// Loads every project directory. Corrupt records are recovered when possible
    /// and otherwise reported in `failed`; they never abort the load.
    pub fn load_all(&self) -> Result<LoadReport, StorageError> {
        let mut report = LoadReport::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if validate_project_id(&id).is_ok() {
                ids.push(id);
            }
        }
        ids.sort();

        for id in ids {
            match self.load(&id) {
                Ok(metadata) => report.projects.push(metadata),
                Err(err) => {
                    warn!(event = "project_load_failed", project_id = %id, error = %err);
                    match self.recover(&id) {
                        Ok(metadata) => {
                            report.recovered.push(id);
                            report.projects.push(metadata);
                        }
                        Err(recovery_err) => {
                            warn!(
                                event = "project_skipped",
                                project_id = %id,
                                error = %recovery_err
                            );
                            report.failed.push((id, err));
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    /// Removes the project directory, logs included. Missing directories are fine.
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let dir = self.project_dir(id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(event = "project_files_deleted", project_id = id);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Snapshots the live metadata file when it parses. Returns whether a backup
    /// was written; a corrupt live file never overwrites a good backup.
    pub fn backup(&self, id: &str) -> Result<bool, StorageError> {
        let dir = self.project_dir(id)?;
        let live = dir.join(METADATA_FILE);
        let bytes = match fs::read(&live) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if parse_metadata(&live, &bytes, id).is_err() {
            return Ok(false);
        }
        let mut file = File::create(dir.join(BACKUP_FILE))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(true)
    }

    pub fn recover(&self, id: &str) -> Result<ProjectMetadata, StorageError> {
        for strategy in RECOVERY_ORDER {
            match strategy.attempt(self, id) {
                Ok(metadata) => {
                    info!(
                        event = "project_recovered",
                        project_id = id,
                        strategy = strategy.as_str()
                    );
                    return Ok(metadata);
                }
                Err(err) => {
                    debug!(
                        event = "recovery_attempt_failed",
                        project_id = id,
                        strategy = strategy.as_str(),
                        error = %err
                    );
                }
            }
        }
        Err(StorageError::RecoveryFailed { id: id.to_string() })
    }
}

fn validate_project_id(id: &str) -> Result<(), StorageError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidProjectId(id.to_string()))
    }
}

fn read_metadata(path: &Path, expected_id: &str) -> Result<ProjectMetadata, StorageError> {
    let bytes = fs::read(path)?;
    parse_metadata(path, &bytes, expected_id)
}

fn parse_metadata(
    path: &Path,
    bytes: &[u8],
    expected_id: &str,
) -> Result<ProjectMetadata, StorageError> {
    let metadata: ProjectMetadata =
        serde_json::from_slice(bytes).map_err(|err| StorageError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if metadata.id != expected_id {
        return Err(StorageError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("id mismatch: found {}", metadata.id),
        });
    }
    Ok(metadata)
}

fn write_atomic(path: &Path, temp_path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    {
        let mut file = File::create(temp_path)?;
        file.write_all(payload)?;
        file.sync_all()?;
    }
    fs::rename(temp_path, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_remote_core::ProjectState;
    use tempfile::TempDir;

    fn sample(id: &str) -> ProjectMetadata {
        let mut metadata = ProjectMetadata::new(id, format!("/work/{id}"));
        metadata.claude_session_id = Some(format!("claude-{id}"));
        metadata
    }

    #[test]
    fn save_then_load_round_trips_and_leaves_no_temp() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path().join("projects")).expect("open store");
        let metadata = sample("p-1");
        store.save(&metadata).expect("save");

        assert_eq!(store.load("p-1").expect("load"), metadata);
        let dir = store.project_dir("p-1").expect("dir");
        assert!(!dir.join(TEMP_FILE).exists());
    }

    #[test]
    fn crash_before_rename_keeps_previous_file_loadable() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path()).expect("open store");
        let good = sample("p-1");
        store.save(&good).expect("save good");

        // Interrupted write: the temp file is half-written and never renamed.
        let dir = store.project_dir("p-1").expect("dir");
        fs::write(dir.join(TEMP_FILE), b"{\"id\":\"p-1\",\"pa").expect("partial temp");

        assert_eq!(store.load("p-1").expect("load"), good);
        let report = store.load_all().expect("load all");
        assert_eq!(report.projects, vec![good]);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn load_all_skips_unrecoverable_records() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path()).expect("open store");
        store.save(&sample("a")).expect("save a");
        store.save(&sample("c")).expect("save c");
        let broken = store.project_dir("b").expect("dir");
        fs::create_dir_all(&broken).expect("mkdir");
        fs::write(broken.join(METADATA_FILE), b"not json").expect("write corrupt");
        fs::write(temp.path().join("stray.txt"), b"ignored").expect("stray file");

        let report = store.load_all().expect("load all");
        let ids: Vec<_> = report.projects.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert!(matches!(
            report.failed[0].1,
            StorageError::Corrupt { .. }
        ));
    }

    #[test]
    fn recovery_prefers_backup() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path()).expect("open store");
        let good = sample("p-1");
        store.save(&good).expect("save");
        assert!(store.backup("p-1").expect("backup"));

        let dir = store.project_dir("p-1").expect("dir");
        fs::write(dir.join(METADATA_FILE), b"{{{{").expect("corrupt live");
        let mut newer = good.clone();
        newer.state = ProjectState::Error;
        fs::write(
            dir.join(TEMP_FILE),
            serde_json::to_vec(&newer).expect("encode"),
        )
        .expect("temp");

        let report = store.load_all().expect("load all");
        assert_eq!(report.recovered, vec!["p-1".to_string()]);
        assert_eq!(report.projects, vec![good.clone()]);
        assert_eq!(store.load("p-1").expect("reload"), good);
    }

    #[test]
    fn recovery_promotes_valid_temp_file_when_backup_missing() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path()).expect("open store");
        let good = sample("p-2");
        let dir = store.project_dir("p-2").expect("dir");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(METADATA_FILE), b"").expect("empty live");
        fs::write(dir.join(TEMP_FILE), serde_json::to_vec(&good).expect("encode"))
            .expect("temp");

        let recovered = store.recover("p-2").expect("recover");
        assert_eq!(recovered, good);
        assert_eq!(store.load("p-2").expect("load"), good);
        assert!(!dir.join(TEMP_FILE).exists());
    }

    #[test]
    fn recovery_rejects_temp_file_for_other_project() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path()).expect("open store");
        let dir = store.project_dir("p-3").expect("dir");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(METADATA_FILE), b"garbage").expect("corrupt live");
        fs::write(
            dir.join(TEMP_FILE),
            serde_json::to_vec(&sample("someone-else")).expect("encode"),
        )
        .expect("temp");

        let err = store.recover("p-3").expect_err("must fail");
        assert!(matches!(err, StorageError::RecoveryFailed { .. }));
        assert_eq!(
            fs::read(dir.join(METADATA_FILE)).expect("live untouched"),
            b"garbage"
        );
    }

    #[test]
    fn backup_skips_corrupt_live_file() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path()).expect("open store");
        let good = sample("p-4");
        store.save(&good).expect("save");
        assert!(store.backup("p-4").expect("first backup"));

        let dir = store.project_dir("p-4").expect("dir");
        fs::write(dir.join(METADATA_FILE), b"oops").expect("corrupt");
        assert!(!store.backup("p-4").expect("second backup"));
        assert_eq!(
            read_metadata(&dir.join(BACKUP_FILE), "p-4").expect("backup intact"),
            good
        );
    }

    #[test]
    fn delete_is_idempotent_and_removes_logs() {
        let temp = TempDir::new().expect("temp dir");
        let store = ProjectStore::open(temp.path()).expect("open store");
        store.save(&sample("p-5")).expect("save");
        let logs = store.logs_dir("p-5").expect("logs dir");
        fs::create_dir_all(&logs).expect("mkdir logs");
        fs::write(logs.join("messages-x.jsonl"), b"{}\n").expect("segment");

        store.delete("p-5").expect("delete");
        assert!(!store.project_dir("p-5").expect("dir").exists());
        store.delete("p-5").expect("second delete");
        assert!(store.load_all().expect("load all").projects.is_empty());
    }

    #[test]
    fn rejects_path_like_ids() {
        let store = ProjectStore::new("/tmp/unused");
        for id in ["", "..", "a/b", "a\\b", "../escape"] {
            assert!(matches!(
                store.project_dir(id),
                Err(StorageError::InvalidProjectId(_))
            ));
        }
    }
}
