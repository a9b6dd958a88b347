//! Ban storage backed by a JSON map file
//!
//! The file maps each banned key to its RFC 3339 expiry and is shared by every
//! process on the host: a long-running `serve` and the scheduled runs that
//! report quota errors all write to it. Each change is applied under an
//! advisory lock to the file's current contents (not to this process's copy)
//! and written back with an atomic temp-file + rename, so one process never
//! erases another's bans. Every write completes before the calling operation
//! returns.
//!
//! Reads use the in-memory copy, reloaded whenever the file on disk has been
//! replaced since it was last read. Expired bans are logically absent; they
//! are deleted the next time the key is checked, or in bulk by
//! `purge_expired`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeDelta, Utc};
use fs2::FileExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

type BanMap = BTreeMap<String, DateTime<Utc>>;

/// A live ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    /// Bare remote name or absolute credential file path
    pub key: String,
    /// Absolute UTC expiry
    pub expires_at: DateTime<Utc>,
}

/// Thread-safe ban file manager.
///
/// One instance per process, shared via `Arc`. Other processes may hold their
/// own instance on the same file.
pub struct BanStore {
    path: PathBuf,
    state: Mutex<State>,
}

struct State {
    bans: BanMap,
    /// Version of the file `bans` was last synced with
    stamp: Option<FileStamp>,
}

impl State {
    fn sync(&mut self, committed: Committed) {
        self.bans = committed.bans;
        self.stamp = committed.stamp;
    }
}

/// Identifies one version of the ban file. Every write replaces the file, so
/// any difference means another writer got there since.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
    #[cfg(unix)]
    inode: u64,
}

impl FileStamp {
    fn of(metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            #[cfg(unix)]
            inode: metadata.ino(),
        }
    }
}

/// One change to the ban file.
enum Change {
    /// Create the file if it doesn't exist
    Touch,
    Set {
        key: String,
        expires_at: DateTime<Utc>,
    },
    Remove {
        key: String,
    },
    /// Remove `key` only if its ban on disk has expired too
    Expire {
        key: String,
        now: DateTime<Utc>,
    },
    PurgeExpired {
        now: DateTime<Utc>,
    },
}

impl Change {
    /// Apply to `bans`. Returns how many entries changed.
    fn apply(&self, bans: &mut BanMap) -> usize {
        match self {
            Change::Touch => 0,
            Change::Set { key, expires_at } => {
                bans.insert(key.clone(), *expires_at);
                1
            }
            Change::Remove { key } => usize::from(bans.remove(key).is_some()),
            Change::Expire { key, now } => match bans.get(key) {
                Some(expires_at) if expires_at <= now => {
                    bans.remove(key);
                    1
                }
                _ => 0,
            },
            Change::PurgeExpired { now } => {
                let before = bans.len();
                bans.retain(|_, expires_at| *expires_at > *now);
                before - bans.len()
            }
        }
    }
}

/// File contents after a change was applied.
struct Committed {
    bans: BanMap,
    changed: usize,
    stamp: Option<FileStamp>,
}

/// Latest expiry a ban is given (9999-12-31T23:59:59Z), so every stored
/// value stays a four-digit-year RFC 3339 timestamp.
fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl BanStore {
    /// Load bans from the given file path.
    ///
    /// If the file doesn't exist it is created as `{}` (and its parent
    /// directory with it). A file that exists but cannot be parsed is an
    /// error.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Io(format!("creating ban store directory: {e}")))?;
        }

        let existed = path.exists();
        let committed = commit(&path, Change::Touch).await?;
        if existed {
            info!(path = %path.display(), bans = committed.bans.len(), "loaded ban store");
        } else {
            info!(path = %path.display(), "ban store not found, starting empty");
        }

        Ok(Self {
            path,
            state: Mutex::new(State {
                bans: committed.bans,
                stamp: committed.stamp,
            }),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether `key` is currently banned.
    ///
    /// Returns the expiry while the ban is active. An expired ban is removed
    /// and the removal flushed; if that flush fails the error is logged and
    /// the key is still reported as not banned.
    pub async fn is_banned(&self, key: &str) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;

        let expires_at = *state.bans.get(key)?;
        let now = Utc::now();
        if expires_at > now {
            return Some(expires_at);
        }

        warn!(key, %expires_at, "ban expired");
        state.bans.remove(key);
        let change = Change::Expire {
            key: key.to_string(),
            now,
        };
        match commit(&self.path, change).await {
            Ok(committed) => state.sync(committed),
            Err(e) => error!(key, error = %e, "failed removing expired ban from store"),
        }

        // Another process may have banned the key again in the meantime
        state.bans.get(key).copied().filter(|e| *e > now)
    }

    /// Ban `key` for `hours` from now.
    pub async fn ban(&self, key: &str, hours: u64) -> Result<DateTime<Utc>> {
        self.ban_for(key, Duration::from_secs(hours.saturating_mul(3600)))
            .await
    }

    /// Ban `key` for `duration` from now. Saturates at 9999-12-31.
    pub async fn ban_for(&self, key: &str, duration: Duration) -> Result<DateTime<Utc>> {
        let limit = far_future();
        let expires_at = TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .map_or(limit, |t| t.min(limit));
        self.ban_until(key, expires_at).await?;
        Ok(expires_at)
    }

    /// Ban `key` until an absolute expiry.
    ///
    /// Overwrites any existing ban for the key: the newest ban wins, even if
    /// it is shorter. On a write failure the ban still applies to this
    /// process, but the caller gets the error because it is not durable.
    pub async fn ban_until(&self, key: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.bans.insert(key.to_string(), expires_at);
        warn!(key, %expires_at, "banned");

        let change = Change::Set {
            key: key.to_string(),
            expires_at,
        };
        let committed = commit(&self.path, change).await.inspect_err(|e| {
            error!(key, error = %e, "failed persisting ban");
        })?;
        state.sync(committed);
        Ok(())
    }

    /// Remove a ban. Returns whether one existed.
    pub async fn unban(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let change = Change::Remove {
            key: key.to_string(),
        };
        let committed = commit(&self.path, change).await?;
        let removed = committed.changed > 0;
        state.sync(committed);
        if removed {
            info!(key, "ban removed");
        }
        Ok(removed)
    }

    /// Return the first banned entry among `keys`, normalizing each to its
    /// remote name (`gdrive:path` → `gdrive`) before lookup.
    pub async fn any_banned<S: AsRef<str>>(&self, keys: &[S]) -> Option<BanEntry> {
        for key in keys {
            let remote = common::remote_name(key.as_ref());
            if let Some(expires_at) = self.is_banned(remote).await {
                return Some(BanEntry {
                    key: remote.to_string(),
                    expires_at,
                });
            }
        }
        None
    }

    /// Snapshot of all active bans, ordered by key.
    pub async fn entries(&self) -> Vec<BanEntry> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        let now = Utc::now();
        state
            .bans
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(key, expires_at)| BanEntry {
                key: key.clone(),
                expires_at: *expires_at,
            })
            .collect()
    }

    /// Delete every expired ban. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let committed = commit(&self.path, Change::PurgeExpired { now: Utc::now() }).await?;
        let removed = committed.changed;
        state.sync(committed);
        if removed > 0 {
            debug!(removed, "purged expired bans");
        }
        Ok(removed)
    }

    /// Purge expired bans and flush before the store goes away.
    pub async fn close(self) -> Result<()> {
        self.purge_expired().await?;
        debug!(path = %self.path.display(), "ban store closed");
        Ok(())
    }

    /// Reload from disk if another writer replaced the file since the last
    /// sync. A file that can't be read keeps the current copy.
    async fn refresh(&self, state: &mut State) {
        let stamp = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => FileStamp::of(&metadata),
            Err(_) => return,
        };
        if state.stamp.as_ref() == Some(&stamp) {
            return;
        }

        let reloaded = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => parse_bans(&self.path, &contents),
            Err(e) => Err(Error::Io(format!("reading ban store: {e}"))),
        };
        match reloaded {
            Ok(bans) => {
                debug!(path = %self.path.display(), bans = bans.len(), "reloaded ban store");
                state.bans = bans;
                state.stamp = Some(stamp);
            }
            Err(e) => warn!(error = %e, "failed reloading ban store, using cached bans"),
        }
    }
}

/// Apply `change` to the file's current contents under the advisory lock.
async fn commit(path: &Path, change: Change) -> Result<Committed> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || commit_locked(&path, &change))
        .await
        .map_err(|e| Error::Io(format!("ban store write task failed: {e}")))?
}

fn commit_locked(path: &Path, change: &Change) -> Result<Committed> {
    let lock = open_lock_file(path)?;
    lock.lock_exclusive()
        .map_err(|e| Error::Io(format!("locking ban store: {e}")))?;

    let mut bans = read_bans(path)?;
    let changed = change.apply(&mut bans);
    if changed > 0 || !path.exists() {
        write_atomic(path, &bans)?;
    }
    let stamp = std::fs::metadata(path).ok().map(|m| FileStamp::of(&m));

    // Unlocked when `lock` is closed
    drop(lock);
    Ok(Committed {
        bans,
        changed,
        stamp,
    })
}

/// Lock file beside the store (`.bans.json.lock` for `bans.json`).
fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bans".into());
    path.with_file_name(format!(".{name}.lock"))
}

fn open_lock_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).truncate(false).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(lock_path(path))
        .map_err(|e| Error::Io(format!("opening ban store lock: {e}")))
}

/// Current file contents. A missing file has no bans.
fn read_bans(path: &Path) -> Result<BanMap> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_bans(path, &contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BanMap::new()),
        Err(e) => Err(Error::Io(format!(
            "reading ban store {}: {e}",
            path.display()
        ))),
    }
}

fn parse_bans(path: &Path, contents: &str) -> Result<BanMap> {
    if contents.trim().is_empty() {
        return Ok(BanMap::new());
    }
    serde_json::from_str(contents)
        .map_err(|e| Error::Parse(format!("parsing ban store {}: {e}", path.display())))
}

/// Write bans to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets permissions to 0600 (owner read/write only) since the
/// keys reveal credential file locations.
fn write_atomic(path: &Path, data: &BanMap) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing bans: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("ban store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".bans.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::Io(format!("writing temp ban file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)
            .map_err(|e| Error::Io(format!("setting ban file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp ban file: {e}")))?;

    debug!(path = %path.display(), bans = data.len(), "persisted bans");
    Ok(())
}
