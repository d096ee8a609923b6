//! Durable state storage.
//!
//! One state record per coordinator instance, mutated only inside a
//! transaction: take an exclusive advisory flock, read and validate the
//! record, apply the mutation, atomically replace the file (temp write,
//! fsync, rename), release the lock. A crash or concurrent reader never
//! observes partial state. Audit events are appended to a JSONL sidecar
//! after the state save; result artifacts live under `results/`.
//!
//! Directory layout:
//! ```text
//! <state_dir>/
//!   state.json        <- the ledger record
//!   state.lock        <- advisory lock file
//!   events.jsonl      <- append-only audit stream
//!   results/<id>.json <- one artifact per completed item
//!   work/<id>/        <- per-item scratch dirs for the command worker
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::ledger::Ledger;
use crate::model::WorkId;

/// Poll interval while waiting for the state lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the state lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Store {
    base: PathBuf,
}

impl Store {
    /// Open a store rooted at `base`, creating the directory layout.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(base.join("results"))?;
        fs::create_dir_all(base.join("work"))?;
        Ok(Self { base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn state_path(&self) -> PathBuf {
        self.base.join("state.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.base.join("state.lock")
    }

    fn events_path(&self) -> PathBuf {
        self.base.join("events.jsonl")
    }

    /// Scratch directory for one work item's execution.
    pub fn work_dir(&self, id: WorkId) -> PathBuf {
        self.base.join("work").join(id.0.to_string())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run a mutating closure against the ledger under the exclusive lock.
    ///
    /// The new state is persisted atomically only if the closure returns
    /// Ok; on Err nothing is written and the previous record survives.
    /// Events emitted during the closure are appended after the save.
    pub fn with_transaction<F, T>(&self, config: &Config, f: F) -> Result<T>
    where
        F: FnOnce(&mut Ledger) -> Result<T>,
    {
        let _guard = self.acquire_lock()?;
        let mut ledger = self.load(config)?;
        let result = f(&mut ledger)?;
        let events = ledger.take_events();
        self.save(&ledger)?;
        self.append_events(&events)?;
        Ok(result)
    }

    /// Run a read-only closure against the ledger under the lock.
    pub fn read<F, T>(&self, config: &Config, f: F) -> Result<T>
    where
        F: FnOnce(&Ledger) -> Result<T>,
    {
        let _guard = self.acquire_lock()?;
        let ledger = self.load(config)?;
        f(&ledger)
    }

    // -----------------------------------------------------------------------
    // State record
    // -----------------------------------------------------------------------

    /// Load the ledger. A missing file yields a fresh ledger; a malformed
    /// one fails closed so no scheduling happens over corrupt state.
    pub fn load(&self, config: &Config) -> Result<Ledger> {
        let path = self.state_path();
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                Error::StateCorruption(format!("malformed {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Ledger::new(config, Utc::now()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the ledger atomically: temp file, fsync, rename.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(ledger)?;
        atomic_write(&self.state_path(), &bytes)
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    fn acquire_lock(&self) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;

        let started = Instant::now();
        loop {
            if try_flock_exclusive(&file)? {
                return Ok(LockGuard { _file: file });
            }
            if started.elapsed() >= LOCK_TIMEOUT {
                return Err(Error::LockTimeout {
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    // -----------------------------------------------------------------------
    // Audit events
    // -----------------------------------------------------------------------

    fn append_events(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())?;
        for event in events {
            let line = serde_json::to_string(event)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// Read audit events with a sequence number greater than `since_seq`.
    /// Lines from a newer schema decode as `Unknown` rather than failing.
    pub fn read_events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let path = self.events_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let events = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).unwrap_or(Event {
                    seq: 0,
                    timestamp: Utc::now(),
                    kind: EventKind::Unknown {
                        raw: line.to_string(),
                    },
                })
            })
            .filter(|event: &Event| event.seq > since_seq || matches!(event.kind, EventKind::Unknown { .. }))
            .collect();
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Result artifacts
    // -----------------------------------------------------------------------

    /// Write a completed item's result artifact. Returns its path.
    pub fn write_result(&self, id: WorkId, data: &serde_json::Value) -> Result<PathBuf> {
        let path = self.base.join("results").join(format!("{}.json", id.0));
        let bytes = serde_json::to_vec_pretty(data)?;
        atomic_write(&path, &bytes)?;
        Ok(path)
    }
}

/// Holds the advisory lock; released when dropped.
struct LockGuard {
    _file: File,
}

/// Atomic replace: write a temp file in the target's directory, fsync,
/// then rename over the target.
fn atomic_write(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target.parent().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path has no parent: {}", target.display()),
        ))
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if another
/// process holds it.
fn try_flock_exclusive(file: &File) -> std::io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: flock is a standard POSIX call; fd is a valid descriptor
        // owned by `file` for the duration of the call.
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
