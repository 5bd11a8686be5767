//! Where snapshots are kept between deployments.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use converge_core::{
    snapshot::{snapshot_from_json, snapshot_to_json, Snapshot},
    urn::StackRef,
};

#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// The last saved snapshot, or `None` for a stack that was never deployed.
    async fn load(&self, stack: &StackRef) -> Result<Option<Snapshot>>;

    /// Replace the stored snapshot. Either the whole snapshot is stored or,
    /// on error, the previous one remains.
    async fn save(&self, stack: &StackRef, snapshot: &Snapshot) -> Result<()>;
}

/// Logs periodically while a blocking wait takes long.
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || WaitMonitor::run(done, activity));
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(Ordering::Relaxed) {
                break;
            }
            tracing::info!(
                waited_s = next_log.duration_since(start).as_secs(),
                "{}",
                activity
            );
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub fn done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}

/// Stores each stack's snapshot as `<dir>/<project>/<stack>.json`.
///
/// Writes go to a temporary file that is renamed over the snapshot, under an
/// exclusive lock on a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileBackend { dir: dir.into() }
    }

    fn stack_dir(&self, stack: &StackRef) -> PathBuf {
        self.dir.join(&stack.project)
    }

    pub fn path(&self, stack: &StackRef) -> PathBuf {
        self.stack_dir(stack).join(format!("{}.json", stack.stack))
    }

    fn lock_path(&self, stack: &StackRef) -> PathBuf {
        self.stack_dir(stack)
            .join(format!("{}.json.lock", stack.stack))
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Could not open lock file {}", path.display()))
}

fn load_blocking(path: &Path, lock_path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let locking = fd_lock::RwLock::new(open_lock_file(lock_path)?);
    let lock_wait_mon = WaitMonitor::new("Waiting for snapshot read lock".to_owned());
    let _guard = locking.read()?;
    lock_wait_mon.done();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read snapshot {}", path.display()))?;
    let snapshot = snapshot_from_json(&contents)
        .with_context(|| format!("Could not parse snapshot {}", path.display()))?;
    Ok(Some(snapshot))
}

fn save_blocking(dir: &Path, path: &Path, lock_path: &Path, contents: &str) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Could not create directory {}", dir.display()))?;
    let mut locking = fd_lock::RwLock::new(open_lock_file(lock_path)?);
    let lock_wait_mon = WaitMonitor::new("Waiting for snapshot write lock".to_owned());
    let _guard = locking.write()?;
    lock_wait_mon.done();

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Could not replace snapshot {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl SnapshotBackend for FileBackend {
    async fn load(&self, stack: &StackRef) -> Result<Option<Snapshot>> {
        let path = self.path(stack);
        let lock_path = self.lock_path(stack);
        tokio::task::spawn_blocking(move || load_blocking(&path, &lock_path)).await?
    }

    async fn save(&self, stack: &StackRef, snapshot: &Snapshot) -> Result<()> {
        let contents = snapshot_to_json(snapshot)?;
        let dir = self.stack_dir(stack);
        let path = self.path(stack);
        let lock_path = self.lock_path(stack);
        tokio::task::spawn_blocking(move || save_blocking(&dir, &path, &lock_path, &contents))
            .await?
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<Snapshot>,
    history: Vec<Snapshot>,
    saves_left: Option<usize>,
}

/// Keeps snapshots in memory and remembers every save. Used by tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let backend = Self::default();
        backend.lock().current = Some(snapshot);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> Option<Snapshot> {
        self.lock().current.clone()
    }

    /// Every successfully saved snapshot, oldest first.
    pub fn history(&self) -> Vec<Snapshot> {
        self.lock().history.clone()
    }

    /// Let the next `n` saves succeed and fail all saves after that.
    pub fn fail_after(&self, n: usize) {
        self.lock().saves_left = Some(n);
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn load(&self, _stack: &StackRef) -> Result<Option<Snapshot>> {
        Ok(self.current())
    }

    async fn save(&self, _stack: &StackRef, snapshot: &Snapshot) -> Result<()> {
        // Round trip to catch anything that would not survive a file backend
        let stored = snapshot_from_json(&snapshot_to_json(snapshot)?)?;
        let mut state = self.lock();
        match state.saves_left {
            Some(0) => bail!("snapshot storage is unavailable"),
            Some(n) => state.saves_left = Some(n - 1),
            None => {}
        }
        state.current = Some(stored.clone());
        state.history.push(stored);
        Ok(())
    }
}
