//! Snapshot storage behind the [`PersistencePort`].
//!
//! The kernel never calls a backend itself.  [`Runtime`][crate::Runtime]
//! captures [`SubjectSnapshot`]s and hands them to the port off the caller's
//! path, so a slow or failing backend never stalls a lifecycle operation.
//! Running without any backend is legal.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryPersistence`] – a concurrent map, for tests and ephemeral use.
//! - [`FilePersistence`] – one JSON document per subject in a directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use s8r_types::{S8rError, SubjectId, SubjectSnapshot};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<PersistenceError> for S8rError {
    fn from(e: PersistenceError) -> Self {
        S8rError::Persistence(e.to_string())
    }
}

/// Optional snapshot store for `{identity, state, environment}`.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Insert or replace the snapshot for `snapshot.identity.id`.
    async fn save(&self, snapshot: SubjectSnapshot) -> Result<(), PersistenceError>;

    async fn load(&self, id: SubjectId) -> Result<Option<SubjectSnapshot>, PersistenceError>;

    /// Every stored snapshot, ancestors before descendants.
    async fn load_all(&self) -> Result<Vec<SubjectSnapshot>, PersistenceError>;

    /// Forget `id`.  Removing an unknown id is not an error.
    async fn remove(&self, id: SubjectId) -> Result<(), PersistenceError>;
}

/// Order snapshots so every ancestor precedes its descendants.
fn by_depth(mut snapshots: Vec<SubjectSnapshot>) -> Vec<SubjectSnapshot> {
    snapshots.sort_by_key(|s| s.identity.lineage.len());
    snapshots
}

// ────────────────────────────────────────────────────────────────────────────
// InMemoryPersistence
// ────────────────────────────────────────────────────────────────────────────

/// Keyed by the snapshot's raw id string, so malformed records round-trip
/// untouched.
#[derive(Default)]
pub struct InMemoryPersistence {
    snapshots: DashMap<String, SubjectSnapshot>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn save(&self, snapshot: SubjectSnapshot) -> Result<(), PersistenceError> {
        self.snapshots.insert(snapshot.identity.id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, id: SubjectId) -> Result<Option<SubjectSnapshot>, PersistenceError> {
        Ok(self.snapshots.get(&id.to_string()).map(|s| s.clone()))
    }

    async fn load_all(&self) -> Result<Vec<SubjectSnapshot>, PersistenceError> {
        Ok(by_depth(
            self.snapshots.iter().map(|entry| entry.value().clone()).collect(),
        ))
    }

    async fn remove(&self, id: SubjectId) -> Result<(), PersistenceError> {
        self.snapshots.remove(&id.to_string());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FilePersistence
// ────────────────────────────────────────────────────────────────────────────

/// Stores each snapshot as `<dir>/<subject-id>.json`.
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Use `dir`, creating it on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl PersistencePort for FilePersistence {
    async fn save(&self, snapshot: SubjectSnapshot) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;
        let path = self.path_for(&snapshot.identity.id);
        let json = serde_json::to_vec_pretty(&snapshot)?;
        // Write-then-rename so a crash never leaves a half-written snapshot.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
        debug!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    async fn load(&self, id: SubjectId) -> Result<Option<SubjectSnapshot>, PersistenceError> {
        let path = self.path_for(&id.to_string());
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    async fn load_all(&self) -> Result<Vec<SubjectSnapshot>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.dir)(e)),
        };
        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(io_err(&path))?;
            snapshots.push(serde_json::from_slice(&bytes)?);
        }
        Ok(by_depth(snapshots))
    }

    async fn remove(&self, id: SubjectId) -> Result<(), PersistenceError> {
        let path = self.path_for(&id.to_string());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}
