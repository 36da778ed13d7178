use crate::session::{Session, SessionContext};
use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where session snapshots go. In-memory state stays authoritative; a
/// snapshot is only a point-in-time copy.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &SessionContext) -> EnsembleResult<()>;
    async fn load(&self, id: Uuid) -> EnsembleResult<Option<SessionContext>>;
    async fn delete(&self, id: Uuid) -> EnsembleResult<()>;
    async fn list(&self) -> EnsembleResult<Vec<Uuid>>;
}

const SNAPSHOT_EXT: &str = "json";
const STAGING_EXT: &str = "staging";

/// Snapshots as one `<session id>.json` file each.
///
/// A save is staged in `<session id>.staging` and renamed over the previous
/// snapshot, so a reader sees either the old copy or the new one. Staging
/// files left by an interrupted save are removed on open.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub async fn new(dir: impl Into<PathBuf>) -> EnsembleResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self { dir };
        let stale = store.entries(STAGING_EXT).await?;
        for id in &stale {
            remove_if_present(&store.path(*id, STAGING_EXT)).await?;
        }
        if !stale.is_empty() {
            warn!(dir = %store.dir.display(), stale = stale.len(), "Discarded interrupted snapshot writes");
        }
        Ok(store)
    }

    /// Directory holding the snapshot files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: Uuid, ext: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ext}"))
    }

    /// Session ids of the files in the directory with extension `ext`.
    async fn entries(&self, ext: &str) -> EnsembleResult<Vec<Uuid>> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

async fn remove_if_present(path: &Path) -> EnsembleResult<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &SessionContext) -> EnsembleResult<()> {
        let staging = self.path(snapshot.id, STAGING_EXT);
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, self.path(snapshot.id, SNAPSHOT_EXT)).await?;
        debug!(session_id = %snapshot.id, bytes = bytes.len(), "Snapshot committed");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> EnsembleResult<Option<SessionContext>> {
        let data = match tokio::fs::read(self.path(id, SNAPSHOT_EXT)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: SessionContext = serde_json::from_slice(&data)
            .map_err(|e| EnsembleError::Session(format!("Failed to parse snapshot {id}: {e}")))?;
        if snapshot.id != id {
            return Err(EnsembleError::Session(format!(
                "snapshot file {id} holds session {}",
                snapshot.id
            )));
        }
        Ok(Some(snapshot))
    }

    async fn delete(&self, id: Uuid) -> EnsembleResult<()> {
        remove_if_present(&self.path(id, SNAPSHOT_EXT)).await
    }

    async fn list(&self) -> EnsembleResult<Vec<Uuid>> {
        self.entries(SNAPSHOT_EXT).await
    }
}

/// Snapshot store kept in process memory; useful for tests and embedding.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, SessionContext>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &SessionContext) -> EnsembleResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> EnsembleResult<Option<SessionContext>> {
        Ok(self.snapshots.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> EnsembleResult<()> {
        self.snapshots.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self) -> EnsembleResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.snapshots.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Periodically persist `session` while it changes.
///
/// A snapshot is written on each tick where the version moved, and once more
/// when `cancel` fires. Save failures are logged and retried on the next tick.
pub fn spawn_snapshotter(
    session: Arc<Session>,
    store: Arc<dyn SnapshotStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut saved_version: Option<u64> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let snapshot = session.snapshot();
                    if saved_version != Some(snapshot.version()) {
                        if let Err(e) = store.save(&snapshot).await {
                            warn!(session_id = %snapshot.id, error = %e, "Final snapshot failed");
                        }
                    }
                    break;
                }
                _ = interval.tick() => {
                    let snapshot = session.snapshot();
                    let version = snapshot.version();
                    if saved_version == Some(version) {
                        continue;
                    }
                    match store.save(&snapshot).await {
                        Ok(()) => {
                            debug!(session_id = %snapshot.id, version, "Snapshot saved");
                            saved_version = Some(version);
                        }
                        Err(e) => warn!(session_id = %snapshot.id, error = %e, "Snapshot failed"),
                    }
                }
            }
        }
    })
}
