use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// A tracked child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub pid: u32,
    pub stream_id: String,
    pub registered_at: DateTime<Utc>,
    /// Kernel start time in clock ticks, used to detect pid reuse.
    pub start_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
    /// Still alive after SIGKILL. The entry is kept.
    Survived,
}

/// Tracks every spawned child so none outlives its task or the service.
pub struct ProcessRegistry {
    entries: Mutex<HashMap<u32, RegistryEntry>>,
    pid_file: Option<PathBuf>,
    grace_period: Duration,
}

impl ProcessRegistry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pid_file: None,
            grace_period,
        }
    }

    /// Registry that mirrors live entries into `path` for crash recovery.
    pub fn with_pid_file(path: impl Into<PathBuf>, grace_period: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pid_file: Some(path.into()),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn register(&self, pid: u32, stream_id: &str) {
        let entry = RegistryEntry {
            pid,
            stream_id: stream_id.to_string(),
            registered_at: Utc::now(),
            start_ticks: process_start_ticks(pid),
        };
        let mut entries = self.lock_entries();
        entries.insert(pid, entry);
        self.persist(&entries);
        debug!(pid, stream_id, "process registered");
    }

    pub fn deregister(&self, pid: u32) -> Option<RegistryEntry> {
        let mut entries = self.lock_entries();
        let removed = entries.remove(&pid);
        if removed.is_some() {
            self.persist(&entries);
            debug!(pid, "process deregistered");
        }
        removed
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.lock_entries().contains_key(&pid)
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut list: Vec<RegistryEntry> = self.lock_entries().values().cloned().collect();
        list.sort_by_key(|e| e.registered_at);
        list
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    /// The entry is removed once the process is confirmed dead.
    pub async fn terminate(&self, pid: u32) -> TerminateOutcome {
        if !is_alive(pid) {
            self.deregister(pid);
            return TerminateOutcome::AlreadyExited;
        }

        signal_group(pid, Signal::SIGTERM);
        if wait_for_exit(pid, self.grace_period).await {
            self.deregister(pid);
            info!(pid, "process terminated");
            return TerminateOutcome::Graceful;
        }

        warn!(pid, grace_ms = self.grace_period.as_millis() as u64, "grace period elapsed, sending SIGKILL");
        signal_group(pid, Signal::SIGKILL);
        if wait_for_exit(pid, KILL_VERIFY_TIMEOUT).await {
            self.deregister(pid);
            info!(pid, "process killed");
            TerminateOutcome::Killed
        } else {
            error!(pid, "process survived SIGKILL");
            TerminateOutcome::Survived
        }
    }

    /// Terminate every registered process. Returns the pids that survived.
    pub async fn terminate_all(&self) -> Vec<u32> {
        let pids: Vec<u32> = self.entries().into_iter().map(|e| e.pid).collect();
        if pids.is_empty() {
            return Vec::new();
        }
        info!(count = pids.len(), "terminating all tracked processes");
        let outcomes =
            futures_util::future::join_all(pids.iter().map(|pid| self.terminate(*pid))).await;
        pids.into_iter()
            .zip(outcomes)
            .filter(|(_, outcome)| *outcome == TerminateOutcome::Survived)
            .map(|(pid, _)| pid)
            .collect()
    }

    /// Immediate SIGKILL without waiting. Used from drop paths.
    pub fn kill_now(&self, pid: u32) {
        if is_alive(pid) {
            warn!(pid, "force-killing process");
            signal_group(pid, Signal::SIGKILL);
        }
        self.deregister(pid);
    }

    /// Kill processes left behind by a previous run, as recorded in the pid
    /// file, then reset the file to the current (normally empty) set.
    pub fn reconcile(&self) -> Vec<u32> {
        let Some(path) = self.pid_file.as_deref() else {
            return Vec::new();
        };
        let previous = match read_pid_file(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read pid file");
                Vec::new()
            }
        };

        let mut reaped = Vec::new();
        {
            let entries = self.lock_entries();
            for stale in previous {
                if entries.contains_key(&stale.pid) || !is_alive(stale.pid) {
                    continue;
                }
                if let (Some(recorded), Some(current)) =
                    (stale.start_ticks, process_start_ticks(stale.pid))
                {
                    if recorded != current {
                        debug!(pid = stale.pid, "pid reused by an unrelated process, skipping");
                        continue;
                    }
                }
                warn!(pid = stale.pid, stream_id = %stale.stream_id, "killing orphaned process");
                signal_group(stale.pid, Signal::SIGKILL);
                reaped.push(stale.pid);
            }
            self.persist(&entries);
        }
        reaped
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<u32, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &HashMap<u32, RegistryEntry>) {
        let Some(path) = self.pid_file.as_deref() else {
            return;
        };
        if let Err(e) = write_pid_file(path, entries.values()) {
            warn!(path = %path.display(), error = %e, "failed to write pid file");
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

/// True if `pid` names a running (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        // EPERM: it exists, we just can't signal it.
        Err(_) => true,
    }
}

fn is_zombie(pid: u32) -> bool {
    proc_stat_fields(pid)
        .and_then(|fields| fields.first().map(|state| state == "Z"))
        .unwrap_or(false)
}

fn process_start_ticks(pid: u32) -> Option<u64> {
    // Field 22 of /proc/<pid>/stat; index 19 once pid and comm are stripped.
    proc_stat_fields(pid)?.get(19)?.parse().ok()
}

/// Fields of /proc/<pid>/stat after the `(comm)` column.
fn proc_stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    Some(rest.split_whitespace().map(str::to_string).collect())
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);
    if let Err(group_err) = killpg(target, signal) {
        if let Err(e) = kill(target, signal) {
            if e != Errno::ESRCH {
                warn!(pid, ?signal, group_error = %group_err, error = %e, "failed to signal process");
            }
        }
    }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn write_pid_file<'a>(
    path: &Path,
    entries: impl Iterator<Item = &'a RegistryEntry>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut contents = String::new();
    for entry in entries {
        let ticks = entry
            .start_ticks
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        contents.push_str(&format!(
            "{} {} {} {}\n",
            entry.pid,
            entry.stream_id,
            entry.registered_at.timestamp_millis(),
            ticks
        ));
    }
    std::fs::write(path, contents)
}

fn read_pid_file(path: &Path) -> std::io::Result<Vec<RegistryEntry>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.lines().filter_map(parse_pid_line).collect())
}

/// Pids 0 and 1, and values that turn negative as `pid_t`, would signal
/// process groups or init rather than one child; such lines are dropped.
fn parse_pid_line(line: &str) -> Option<RegistryEntry> {
    let mut parts = line.split_whitespace();
    let pid: u32 = parts.next()?.parse().ok()?;
    if pid <= 1 || i32::try_from(pid).is_err() {
        return None;
    }
    let stream_id = parts.next().unwrap_or("unknown").to_string();
    let registered_at = parts
        .next()
        .and_then(|ms| ms.parse().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    let start_ticks = parts.next().and_then(|t| t.parse().ok());
    Some(RegistryEntry {
        pid,
        stream_id,
        registered_at,
        start_ticks,
    })
}
