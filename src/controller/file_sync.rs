use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::event_bus::EventBus;
use super::runtime::{ContainerRuntime, ExecRequest};
use super::workspace;
use crate::shared::models::constants::{SANDBOX_USER, WORKSPACE_DIR};
use crate::shared::models::{
    EntryKind, FileChange, FileChanges, SandboxError, SandboxEvent, SandboxResult,
};
use crate::shared::store::ProjectStore;
use crate::shared::SandboxConfig;

const SNAPSHOT_SCRIPT: &str =
    "find /workspace -mindepth 1 \\( -type f -o -type d \\) -printf '%y|%T@|%s|%P\\n'";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub kind: EntryKind,
    /// `%T@` as printed; compared textually.
    pub mod_time: String,
    pub size: u64,
}

/// Relative path -> entry, ordered so parents sort before children.
pub type Snapshot = BTreeMap<String, SnapshotEntry>;

/// Parse `find -printf '%y|%T@|%s|%P\n'` output. Lines that don't fit are
/// skipped.
pub fn parse_snapshot(output: &str) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for line in output.lines() {
        let mut fields = line.splitn(4, '|');
        let (Some(kind), Some(mod_time), Some(size), Some(path)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let kind = match kind {
            "f" => EntryKind::File,
            "d" => EntryKind::Folder,
            _ => continue,
        };
        if path.is_empty() {
            continue;
        }
        snapshot.insert(
            path.to_string(),
            SnapshotEntry {
                kind,
                mod_time: mod_time.to_string(),
                size: size.parse().unwrap_or(0),
            },
        );
    }
    snapshot
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<(String, EntryKind)>,
    pub modified: Vec<String>,
    pub deleted: Vec<(String, EntryKind)>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Added in path order (parents first), deleted in reverse path order
/// (children first). Only files can be modified.
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();
    for (path, entry) in current {
        match previous.get(path) {
            None => diff.added.push((path.clone(), entry.kind)),
            Some(old) if old.kind != entry.kind => {
                // A file replaced by a folder (or back) is delete + add
                diff.deleted.push((path.clone(), old.kind));
                diff.added.push((path.clone(), entry.kind));
            }
            Some(old) => {
                if entry.kind == EntryKind::File
                    && (old.size != entry.size || old.mod_time != entry.mod_time)
                {
                    diff.modified.push(path.clone());
                }
            }
        }
    }
    for (path, entry) in previous.iter().rev() {
        if !current.contains_key(path) {
            diff.deleted.push((path.clone(), entry.kind));
        }
    }
    diff.deleted.sort_by(|a, b| b.0.cmp(&a.0));
    diff
}

/// Polls each running sandbox's workspace and pushes differences to the
/// project store.
pub struct FileSyncReconciler {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ProjectStore>,
    events: EventBus,
    interval: Duration,
    // The baseline lives behind the per-project lock; holding it is the pass guard
    baselines: Mutex<HashMap<String, Arc<Mutex<Snapshot>>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FileSyncReconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
        events: EventBus,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            events,
            interval: Duration::from_millis(config.file_sync.interval_ms),
            baselines: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn snapshot(&self, container_id: &str) -> SandboxResult<Snapshot> {
        let request = ExecRequest::shell(SNAPSHOT_SCRIPT)
            .user(SANDBOX_USER)
            .working_dir(WORKSPACE_DIR);
        let output = self.runtime.exec(container_id, request).await?;
        // find exits 1 on unreadable entries but still prints the rest
        if output.exit_code > 1 {
            return Err(SandboxError::Reconciliation(format!(
                "workspace listing failed with exit {}",
                output.exit_code
            )));
        }
        Ok(parse_snapshot(&output.stdout_lossy()))
    }

    /// Record the current tree as the baseline and start polling.
    pub async fn start(self: &Arc<Self>, project_id: &str, container_id: &str) {
        let initial = match self.snapshot(container_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Initial snapshot for {} failed: {}", project_id, e);
                Snapshot::new()
            }
        };
        let entries = initial.len();
        self.baselines
            .lock()
            .await
            .insert(project_id.to_string(), Arc::new(Mutex::new(initial)));

        let reconciler = Arc::clone(self);
        let project = project_id.to_string();
        let container = container_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the baseline was just taken
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = reconciler.run_pass(&project, &container).await {
                    debug!("File sync pass for {} failed: {}", project, e);
                }
            }
        });

        if let Some(previous) = self.tasks.lock().await.insert(project_id.to_string(), handle) {
            previous.abort();
        }
        info!("File sync started for project {} ({} entries)", project_id, entries);
    }

    pub async fn stop(&self, project_id: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(project_id) {
            handle.abort();
            info!("File sync stopped for project {}", project_id);
        }
        self.baselines.lock().await.remove(project_id);
    }

    pub async fn is_running(&self, project_id: &str) -> bool {
        self.tasks.lock().await.contains_key(project_id)
    }

    /// One reconcile pass. The returned changes are the ones the store
    /// accepted; failed paths keep their old baseline and retry next pass.
    pub async fn run_pass(&self, project_id: &str, container_id: &str) -> SandboxResult<FileChanges> {
        let baseline = self
            .baselines
            .lock()
            .await
            .get(project_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("file sync for {}", project_id)))?;
        let mut baseline = baseline.lock().await;

        let current = self.snapshot(container_id).await?;
        let diff = diff_snapshots(&baseline, &current);
        if diff.is_empty() {
            return Ok(FileChanges::default());
        }

        let mut next = current;
        let mut changes = FileChanges::default();

        for (path, kind) in &diff.deleted {
            match self.store.delete(project_id, path).await {
                Ok(()) => changes.deleted.push(FileChange {
                    path: path.clone(),
                    kind: *kind,
                }),
                Err(e) => {
                    warn!("Failed to delete {} for {}: {}", path, project_id, e);
                    restore_entry(&mut next, &baseline, path);
                }
            }
        }

        for (path, kind) in &diff.added {
            let result = match kind {
                EntryKind::Folder => self.store.create_folder(project_id, path).await,
                EntryKind::File => self.upload(project_id, container_id, path).await,
            };
            match result {
                Ok(()) => changes.added.push(FileChange {
                    path: path.clone(),
                    kind: *kind,
                }),
                Err(e) => {
                    warn!("Failed to sync new {} for {}: {}", path, project_id, e);
                    restore_entry(&mut next, &baseline, path);
                }
            }
        }

        for path in &diff.modified {
            match self.upload(project_id, container_id, path).await {
                Ok(()) => changes.modified.push(FileChange {
                    path: path.clone(),
                    kind: EntryKind::File,
                }),
                Err(e) => {
                    warn!("Failed to sync {} for {}: {}", path, project_id, e);
                    restore_entry(&mut next, &baseline, path);
                }
            }
        }

        *baseline = next;

        if !changes.is_empty() {
            debug!(
                "Synced {} added, {} modified, {} deleted for {}",
                changes.added.len(),
                changes.modified.len(),
                changes.deleted.len(),
                project_id
            );
            self.events.publish(SandboxEvent::FilesChanged {
                project_id: project_id.to_string(),
                changes: changes.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(changes)
    }

    async fn upload(&self, project_id: &str, container_id: &str, path: &str) -> SandboxResult<()> {
        let content = workspace::read_file(self.runtime.as_ref(), container_id, path).await?;
        self.store.write(project_id, path, &content).await
    }
}

/// Put `path` back to its baseline state (or absence) in `next`.
fn restore_entry(next: &mut Snapshot, baseline: &Snapshot, path: &str) {
    match baseline.get(path) {
        Some(entry) => {
            next.insert(path.to_string(), entry.clone());
        }
        None => {
            next.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{FakeRuntime, MemoryProjectStore, StoreCall};

    fn entry(kind: EntryKind, mod_time: &str, size: u64) -> SnapshotEntry {
        SnapshotEntry {
            kind,
            mod_time: mod_time.to_string(),
            size,
        }
    }

    #[test]
    fn test_parse_snapshot_lines() {
        let out = "d|1700000000.0000000000|4096|src\n\
                   f|1700000001.5000000000|12|src/a|b.js\n\
                   garbage\n\
                   l|1|1|link\n";
        let snapshot = parse_snapshot(out);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["src"].kind, EntryKind::Folder);
        // Pipes inside the name stay in the path
        assert_eq!(snapshot["src/a|b.js"].size, 12);
    }

    #[test]
    fn test_diff_orders_creates_and_deletes() {
        let previous = Snapshot::from([
            ("old".to_string(), entry(EntryKind::Folder, "1", 0)),
            ("old/x.txt".to_string(), entry(EntryKind::File, "1", 3)),
            ("keep.txt".to_string(), entry(EntryKind::File, "1", 3)),
            ("dir".to_string(), entry(EntryKind::Folder, "1", 0)),
        ]);
        let current = Snapshot::from([
            ("new".to_string(), entry(EntryKind::Folder, "2", 0)),
            ("new/y.txt".to_string(), entry(EntryKind::File, "2", 5)),
            ("keep.txt".to_string(), entry(EntryKind::File, "2", 3)),
            ("dir".to_string(), entry(EntryKind::Folder, "9", 0)),
        ]);
        let diff = diff_snapshots(&previous, &current);
        assert_eq!(
            diff.added,
            vec![
                ("new".to_string(), EntryKind::Folder),
                ("new/y.txt".to_string(), EntryKind::File)
            ]
        );
        assert_eq!(diff.modified, vec!["keep.txt".to_string()]);
        assert_eq!(
            diff.deleted,
            vec![
                ("old/x.txt".to_string(), EntryKind::File),
                ("old".to_string(), EntryKind::Folder)
            ]
        );
    }

    async fn setup() -> (
        Arc<FakeRuntime>,
        Arc<MemoryProjectStore>,
        FileSyncReconciler,
        String,
    ) {
        let runtime = Arc::new(FakeRuntime::new());
        let id = runtime.add_running_container("sandbox-p1").await;
        let store = Arc::new(MemoryProjectStore::new());
        let reconciler = FileSyncReconciler::new(
            runtime.clone(),
            store.clone(),
            EventBus::new(),
            &SandboxConfig::default(),
        );
        (runtime, store, reconciler, id)
    }

    async fn set_baseline(reconciler: &FileSyncReconciler, listing: &str) {
        reconciler.baselines.lock().await.insert(
            "p1".to_string(),
            Arc::new(Mutex::new(parse_snapshot(listing))),
        );
    }

    #[tokio::test]
    async fn test_identical_snapshots_make_no_store_calls() {
        let (runtime, store, reconciler, id) = setup().await;
        runtime.set_find_output(&id, "f|1.0|3|a.txt\n");
        set_baseline(&reconciler, "f|1.0|3|a.txt\n").await;

        let changes = reconciler.run_pass("p1", &id).await.unwrap();
        assert!(changes.is_empty());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_one_of_each_change_in_a_single_event() {
        let (runtime, store, mut reconciler, id) = setup().await;
        let events = EventBus::new();
        let mut rx = events.subscribe();
        reconciler.events = events;

        runtime.put_file(&id, "/workspace/new.txt", b"new");
        runtime.put_file(&id, "/workspace/mod.txt", b"changed");
        set_baseline(&reconciler, "f|1.0|3|mod.txt\nf|1.0|3|gone.txt\n").await;
        runtime.set_find_output(&id, "f|2.0|7|mod.txt\nf|2.0|3|new.txt\n");

        let changes = reconciler.run_pass("p1", &id).await.unwrap();
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.deleted.len(), 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "files:changed");
        assert!(rx.try_recv().is_err());

        assert_eq!(store.file("p1", "mod.txt").unwrap(), b"changed".to_vec());
        assert!(store.calls().contains(&StoreCall::Delete("gone.txt".to_string())));
    }

    #[tokio::test]
    async fn test_failed_upload_is_retried_next_pass() {
        let (runtime, store, reconciler, id) = setup().await;
        set_baseline(&reconciler, "").await;
        runtime.set_find_output(&id, "d|1.0|0|src\nf|1.0|2|src/a.js\n");
        runtime.put_file(&id, "/workspace/src/a.js", b"ok");

        store.fail_writes(true);
        let first = reconciler.run_pass("p1", &id).await.unwrap();
        assert_eq!(first.added.len(), 1);
        assert_eq!(first.added[0].path, "src");

        store.fail_writes(false);
        let second = reconciler.run_pass("p1", &id).await.unwrap();
        assert_eq!(second.added.len(), 1);
        assert_eq!(second.added[0].path, "src/a.js");

        let third = reconciler.run_pass("p1", &id).await.unwrap();
        assert!(third.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uploads_never_follow_host_links() {
        let (runtime, store, reconciler, id) = setup().await;
        let host = tempfile::tempdir().unwrap();
        let secrets = host.path().join("secrets");
        std::fs::create_dir_all(&secrets).unwrap();
        std::fs::write(secrets.join("x"), "host secret").unwrap();
        let workspace = host.path().join("sandbox-p1");
        std::fs::create_dir_all(&workspace).unwrap();
        std::os::unix::fs::symlink(&secrets, workspace.join("a")).unwrap();

        set_baseline(&reconciler, "").await;
        runtime.set_find_output(&id, "d|1.0|0|a\nf|1.0|6|a/x\n");
        runtime.put_file(&id, "/workspace/a/x", b"inside");

        let changes = reconciler.run_pass("p1", &id).await.unwrap();
        assert_eq!(changes.added.len(), 2);
        assert_eq!(store.file("p1", "a/x").unwrap(), b"inside".to_vec());
    }
}
