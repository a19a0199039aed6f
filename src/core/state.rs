//! Queue store: load, save (atomic), append, import, clear, reset.
//!
//! One store value per invocation, passed explicitly. Every mutating
//! operation holds the single-writer lock (`<store>.lock`) for its duration;
//! the executor holds it for a whole run.

use super::error::StoreError;
use super::parser::{remap_specs, TaskSpec};
use super::types::*;
use crate::provenance::eventlog::{self, now_iso8601};
use serde::Deserialize;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_POLL: Duration = Duration::from_millis(25);

/// Handle to the persisted queue file.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
    lock_timeout: Duration,
    event_log: bool,
}

/// Held while the store is locked. Releases on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

/// On-disk shapes accepted by `load`: a bare task list or a full queue.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredQueue {
    List(Vec<Task>),
    Queue(Queue),
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// The recorded pid, if the lock file names a process that no longer exists.
fn dead_holder(lock_path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(lock_path).ok()?;
    let pid = content.trim().parse::<u32>().ok()?;
    (!pid_alive(pid)).then_some(pid)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        // signal 0: existence check only; EPERM still means alive
        Ok(raw) if raw > 0 => !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)),
        _ => true,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_millis(5000),
            event_log: true,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_event_log(mut self, enabled: bool) -> Self {
        self.event_log = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, ".lock")
    }

    pub fn event_log_path(&self) -> PathBuf {
        eventlog::event_log_path(&self.path)
    }

    /// Acquire the single-writer lock, waiting up to the configured timeout.
    pub fn lock(&self) -> Result<StoreLock, StoreError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let start = Instant::now();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    // pid lets a later process recognise a lock left by a crash
                    let _ = writeln!(file, "{}", std::process::id());
                    tracing::debug!(path = %lock_path.display(), "store locked");
                    return Ok(StoreLock { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = dead_holder(&lock_path) {
                        tracing::warn!(
                            path = %lock_path.display(),
                            pid,
                            "removing stale store lock"
                        );
                        match std::fs::remove_file(&lock_path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(StoreError::io(&lock_path, e)),
                        }
                    }
                    if start.elapsed() >= self.lock_timeout {
                        return Err(StoreError::LockTimeout {
                            path: lock_path,
                            waited_ms: u64::try_from(start.elapsed().as_millis())
                                .unwrap_or(u64::MAX),
                        });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(StoreError::io(&lock_path, e)),
            }
        }
    }

    /// Load the queue. A missing file is an empty queue.
    pub fn load(&self) -> Result<Queue, StoreError> {
        if !self.path.exists() {
            return Ok(Queue::default());
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        if content.trim().is_empty() {
            return Ok(Queue::default());
        }

        let stored: StoredQueue = if is_yaml(&self.path) {
            serde_yaml_ng::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        }
        .map_err(|message| StoreError::Parse {
            path: self.path.clone(),
            message,
        })?;

        let mut queue = match stored {
            StoredQueue::List(tasks) => Queue {
                tasks,
                ..Queue::default()
            },
            StoredQueue::Queue(queue) => queue,
        };
        queue.tasks.sort_by_key(|t| t.index);
        for task in &mut queue.tasks {
            task.index_refs();
        }
        let past_last = queue.tasks.last().map(|t| t.index + 1).unwrap_or(1);
        queue.next_index = queue.next_index.max(past_last);
        Ok(queue)
    }

    /// Save atomically (write to temp, then rename). Caller holds the lock.
    pub fn save(&self, queue: &Queue) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let encoded = if is_yaml(&self.path) {
            serde_yaml_ng::to_string(queue).map_err(|e| e.to_string())
        } else {
            serde_json::to_string_pretty(queue).map_err(|e| e.to_string())
        }
        .map_err(|message| StoreError::Parse {
            path: self.path.clone(),
            message,
        })?;

        let tmp_path = with_suffix(&self.path, ".tmp");
        std::fs::write(&tmp_path, encoded).map_err(|e| StoreError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    /// Append tasks with fresh indices, in order. Indices given in the input are ignored.
    pub fn append(&self, specs: Vec<TaskSpec>) -> Result<Vec<u32>, StoreError> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;
        let indices = push_specs(&mut queue, specs);
        self.save(&queue)?;
        self.record(QueueEvent::TasksAppended {
            indices: indices.clone(),
        });
        tracing::info!(count = indices.len(), "tasks appended");
        Ok(indices)
    }

    /// Append tasks from a queue file, remapping file-local indices.
    pub fn import(&self, specs: Vec<TaskSpec>) -> Result<Vec<u32>, StoreError> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;
        let specs = remap_specs(specs, queue.next_index).map_err(StoreError::Import)?;
        let indices = push_specs(&mut queue, specs);
        self.save(&queue)?;
        self.record(QueueEvent::TasksAppended {
            indices: indices.clone(),
        });
        tracing::info!(count = indices.len(), "tasks imported");
        Ok(indices)
    }

    /// Remove tasks by scope. Indices are never reused.
    pub fn clear(&self, scope: ClearScope) -> Result<Vec<u32>, StoreError> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;
        let removed: Vec<u32> = queue
            .tasks
            .iter()
            .filter(|t| scope.matches(t.status))
            .map(|t| t.index)
            .collect();
        queue.tasks.retain(|t| !scope.matches(t.status));
        self.save(&queue)?;
        self.record(QueueEvent::QueueCleared {
            scope,
            removed: removed.clone(),
        });
        tracing::info!(%scope, count = removed.len(), "queue cleared");
        Ok(removed)
    }

    /// Return failed tasks to pending. `None` selects every failed task.
    pub fn reset(&self, indices: Option<&[u32]>) -> Result<Vec<u32>, StoreError> {
        let _lock = self.lock()?;
        let mut queue = self.load()?;

        let selected: Vec<u32> = match indices {
            None => queue
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.index)
                .collect(),
            Some(list) => {
                for &index in list {
                    let task = queue.get(index).ok_or(StoreError::NoSuchTask(index))?;
                    if task.status != TaskStatus::Failed {
                        return Err(StoreError::NotResettable {
                            index,
                            status: task.status.to_string(),
                        });
                    }
                }
                list.to_vec()
            }
        };

        for &index in &selected {
            if let Some(task) = queue.get_mut(index) {
                task.status = TaskStatus::Pending;
                task.error = None;
                task.result = None;
                task.finished_at = None;
            }
        }
        self.save(&queue)?;
        self.record(QueueEvent::TasksReset {
            indices: selected.clone(),
        });
        Ok(selected)
    }

    /// Best-effort provenance event; a failed write is logged, not returned.
    pub fn record(&self, event: QueueEvent) {
        if !self.event_log {
            return;
        }
        if let Err(e) = eventlog::append_event(&self.event_log_path(), event) {
            tracing::warn!(error = %e, "event log write failed");
        }
    }
}

/// Push specs onto `queue` as pending tasks with fresh indices.
pub(crate) fn push_specs(queue: &mut Queue, specs: Vec<TaskSpec>) -> Vec<u32> {
    let now = now_iso8601();
    if queue.created_at.is_none() {
        queue.created_at = Some(now.clone());
    }
    specs
        .into_iter()
        .map(|spec| {
            let index = queue.next_index;
            queue.next_index += 1;
            let mut task = Task::new(index, spec.action, spec.params, spec.depends_on);
            task.created_at = Some(now.clone());
            queue.tasks.push(task);
            index
        })
        .collect()
}
