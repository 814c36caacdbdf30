//! Per-job scratch directories.
//!
//! Every job gets `<scratch_root>/job-<id>`, created before its download
//! starts and removed exactly once when it ends. Directories left behind by
//! a previous run are swept at startup.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use walkdir::WalkDir;

use crate::error::WorkspaceError;
use crate::job::JobId;

const WORKSPACE_PREFIX: &str = "job-";
const MANIFEST_NAME: &str = "job.json";

/// Workspaces held by any manager in this process
fn live_in_process() -> std::sync::MutexGuard<'static, HashSet<PathBuf>> {
    static LIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Whether a process with `pid` is still running
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM: alive, owned by someone else
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Reports free bytes on the volume holding a path
pub type SpaceProbe = Arc<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

/// Free bytes on the mounted volume that contains `path`
pub fn system_free_space(path: &Path) -> Option<u64> {
    let target = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Written into each workspace so the sweep can tell whose directory it is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub job_id: JobId,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Allocates, tracks and reclaims job workspaces under one root
pub struct WorkspaceManager {
    root: PathBuf,
    min_free_bytes: u64,
    space_probe: SpaceProbe,
    active: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("root", &self.root)
            .field("min_free_bytes", &self.min_free_bytes)
            .finish()
    }
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, min_free_bytes: u64) -> Result<Self, WorkspaceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| WorkspaceError::io(&root, e))?;
        Ok(Self {
            root,
            min_free_bytes,
            space_probe: Arc::new(system_free_space),
            active: Mutex::new(HashSet::new()),
        })
    }

    /// Replace the free-space lookup (tests, exotic filesystems)
    pub fn with_space_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn(&Path) -> Option<u64> + Send + Sync + 'static,
    {
        self.space_probe = Arc::new(probe);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn active_set(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the workspace for `job`, refusing when the volume is below the free-space floor
    pub fn allocate(self: &Arc<Self>, job: JobId) -> Result<Workspace, WorkspaceError> {
        if self.min_free_bytes > 0 {
            match (self.space_probe)(&self.root) {
                Some(available) if available < self.min_free_bytes => {
                    return Err(WorkspaceError::InsufficientSpace {
                        root: self.root.clone(),
                        available,
                        required: self.min_free_bytes,
                    });
                }
                Some(available) => debug!("Job {}: {} bytes free under {}", job, available, self.root.display()),
                None => debug!("Job {}: free space under {} unknown, skipping check", job, self.root.display()),
            }
        }

        let path = self.root.join(format!("{}{}", WORKSPACE_PREFIX, job));
        // create_dir, not create_dir_all: an existing directory means a collision
        fs::create_dir(&path).map_err(|e| WorkspaceError::io(&path, e))?;

        let manifest = WorkspaceManifest {
            job_id: job,
            pid: std::process::id(),
            created_at: Utc::now(),
        };
        let manifest_path = path.join(MANIFEST_NAME);
        let written = serde_json::to_vec_pretty(&manifest)
            .map_err(std::io::Error::from)
            .and_then(|bytes| fs::write(&manifest_path, bytes));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_dir_all(&path) {
                warn!("Job {}: failed to remove half-created workspace {}: {}", job, path.display(), cleanup);
            }
            return Err(WorkspaceError::io(manifest_path, e));
        }

        self.active_set().insert(path.clone());
        live_in_process().insert(path.clone());
        info!("Job {}: 📁 Allocated workspace {}", job, path.display());

        Ok(Workspace {
            path,
            manager: Arc::clone(self),
            released: false,
        })
    }

    /// Remove a workspace; returns false if it was already gone. Safe to call repeatedly.
    pub fn release(&self, path: &Path) -> Result<bool, WorkspaceError> {
        self.active_set().remove(path);
        live_in_process().remove(path);
        match fs::remove_dir_all(path) {
            Ok(()) => {
                info!("🗑️  Released workspace {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(WorkspaceError::io(path, e)),
        }
    }

    /// Workspaces currently owned by live jobs
    pub fn active_workspaces(&self) -> Vec<PathBuf> {
        self.active_set().iter().cloned().collect()
    }

    /// Read the manifest of a workspace directory, if it has a readable one
    pub fn read_manifest(path: &Path) -> Option<WorkspaceManifest> {
        let content = fs::read(path.join(MANIFEST_NAME)).ok()?;
        serde_json::from_slice(&content).ok()
    }

    /// Remove `job-*` directories under the root that no live job owns.
    /// A workspace is live when a manager in this process holds it, or when
    /// its manifest names another process that is still running.
    /// Returns the number of directories removed.
    pub fn sweep_orphans(&self) -> Result<usize, WorkspaceError> {
        let own_pid = std::process::id();
        let mut removed = 0;

        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading scratch root entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            let is_workspace = entry.file_type().is_dir()
                && entry.file_name().to_str().map(|n| n.starts_with(WORKSPACE_PREFIX)).unwrap_or(false);
            if !is_workspace || live_in_process().contains(path) {
                continue;
            }

            match Self::read_manifest(path) {
                Some(manifest) if manifest.pid != own_pid && process_alive(manifest.pid) => {
                    debug!(
                        "Keeping workspace {} of job {}: pid {} is still running",
                        path.display(),
                        manifest.job_id,
                        manifest.pid
                    );
                    continue;
                }
                Some(manifest) => info!(
                    "🧹 Sweeping orphaned workspace of job {} (pid {}, created {})",
                    manifest.job_id, manifest.pid, manifest.created_at
                ),
                None => info!("🧹 Sweeping orphaned workspace {}", path.display()),
            }

            match fs::remove_dir_all(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => warn!("Failed to sweep {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }
}

/// Exclusive handle to one job's workspace; the directory goes away on
/// [`Workspace::release`] or, failing that, when the handle drops.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    manager: Arc<WorkspaceManager>,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the workspace
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn release(mut self) -> Result<(), WorkspaceError> {
        self.released = true;
        self.manager.release(&self.path).map(|_| ())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.path) {
            warn!("Failed to release workspace {} on drop: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> Arc<WorkspaceManager> {
        Arc::new(WorkspaceManager::new(root, 0).unwrap())
    }

    #[test]
    fn test_allocate_creates_directory_with_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let job = JobId::new();

        let ws = mgr.allocate(job).unwrap();
        assert!(ws.path().is_dir());
        assert!(ws.path().starts_with(tmp.path()));
        let manifest = WorkspaceManager::read_manifest(ws.path()).unwrap();
        assert_eq!(manifest.job_id, job);
        assert_eq!(manifest.pid, std::process::id());
        assert_eq!(mgr.active_workspaces(), vec![ws.path().to_path_buf()]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let ws = mgr.allocate(JobId::new()).unwrap();
        let path = ws.path().to_path_buf();
        std::fs::write(ws.file("source.mkv"), b"data").unwrap();

        ws.release().unwrap();
        assert!(!path.exists());
        assert!(!mgr.release(&path).unwrap());
        assert!(mgr.active_workspaces().is_empty());
    }

    #[test]
    fn test_drop_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let path = {
            let ws = mgr.allocate(JobId::new()).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_insufficient_space_is_refused_before_creating_anything() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = Arc::new(
            WorkspaceManager::new(tmp.path(), 10_000)
                .unwrap()
                .with_space_probe(|_| Some(10)),
        );

        match mgr.allocate(JobId::new()) {
            Err(WorkspaceError::InsufficientSpace { available, required, .. }) => {
                assert_eq!(available, 10);
                assert_eq!(required, 10_000);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_free_space_does_not_block() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = Arc::new(
            WorkspaceManager::new(tmp.path(), u64::MAX)
                .unwrap()
                .with_space_probe(|_| None),
        );
        assert!(mgr.allocate(JobId::new()).is_ok());
    }

    #[test]
    fn test_sweep_removes_only_orphaned_job_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("job-left-over")).unwrap();
        std::fs::write(tmp.path().join("job-left-over").join("source.mp4"), b"x").unwrap();
        std::fs::create_dir(tmp.path().join("keep-me")).unwrap();
        std::fs::write(tmp.path().join("job-file-not-dir"), b"x").unwrap();

        let mgr = manager(tmp.path());
        let live = mgr.allocate(JobId::new()).unwrap();

        assert_eq!(mgr.sweep_orphans().unwrap(), 1);
        assert!(!tmp.path().join("job-left-over").exists());
        assert!(tmp.path().join("keep-me").exists());
        assert!(tmp.path().join("job-file-not-dir").exists());
        assert!(live.path().exists());
    }

    #[test]
    fn test_second_manager_on_the_same_root_keeps_live_workspaces() {
        let tmp = tempfile::tempdir().unwrap();
        let running = manager(tmp.path());
        let live = running.allocate(JobId::new()).unwrap();

        let sweeper = manager(tmp.path());
        assert_eq!(sweeper.sweep_orphans().unwrap(), 0);
        assert!(live.path().is_dir());

        let path = live.path().to_path_buf();
        live.release().unwrap();
        std::fs::create_dir(&path).unwrap();
        // released and recreated by hand: nobody owns it any more
        assert_eq!(sweeper.sweep_orphans().unwrap(), 1);
    }

    #[cfg(unix)]
    fn plant_workspace(root: &Path, name: &str, pid: u32) -> PathBuf {
        let path = root.join(name);
        std::fs::create_dir(&path).unwrap();
        let manifest = WorkspaceManifest {
            job_id: JobId::new(),
            pid,
            created_at: Utc::now(),
        };
        std::fs::write(path.join(MANIFEST_NAME), serde_json::to_vec(&manifest).unwrap()).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_sweep_respects_workspaces_of_other_running_processes() {
        let tmp = tempfile::tempdir().unwrap();

        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut finished = std::process::Command::new("true").spawn().unwrap();
        finished.wait().unwrap();

        let owned = plant_workspace(tmp.path(), "job-other-daemon", other.id());
        let stale = plant_workspace(tmp.path(), "job-dead-daemon", finished.id());

        let removed = manager(tmp.path()).sweep_orphans().unwrap();
        other.kill().unwrap();
        other.wait().unwrap();

        assert_eq!(removed, 1);
        assert!(owned.is_dir());
        assert!(!stale.exists());
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || mgr.allocate(JobId::new()).unwrap())
            })
            .collect();
        let workspaces: Vec<Workspace> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let distinct: HashSet<_> = workspaces.iter().map(|w| w.path().to_path_buf()).collect();
        assert_eq!(distinct.len(), 16);
        assert_eq!(mgr.active_workspaces().len(), 16);
    }
}
