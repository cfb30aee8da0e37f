//! Lock-scoped atomic mutation helpers for the JSONL collision table.

use crate::table::{CollisionStoreError, CollisionTable};
use chrono::{DateTime, Utc};
use std::error::Error as StdError;
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub fn collision_lock_path(collisions_path: &Path) -> PathBuf {
    let mut path: OsString = collisions_path.as_os_str().to_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(60);

/// How long a mutation waits for a busy lock before giving up, and when a
/// lock left behind by a killed process is taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub wait: Duration,
    pub poll: Duration,
    /// A lock whose `utc=` stamp (or, without one, its mtime) is older than
    /// this belongs to a dead holder.
    pub stale_after: Duration,
}

impl LockPolicy {
    /// Fail immediately on a busy lock.
    pub const NO_WAIT: Self = Self {
        wait: Duration::ZERO,
        poll: Duration::from_millis(5),
        stale_after: DEFAULT_STALE_LOCK_AFTER,
    };

    pub fn waiting(wait: Duration) -> Self {
        Self {
            wait,
            ..Self::NO_WAIT
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::waiting(Duration::from_secs(2))
    }
}

#[derive(Debug)]
pub enum AtomicStoreMutationError<E> {
    LockBusy { lock_path: String },
    LockIo { lock_path: String, message: String },
    Store(CollisionStoreError),
    Mutation(E),
}

impl<E> AtomicStoreMutationError<E> {
    fn lock_busy(lock_path: &Path) -> Self {
        Self::LockBusy {
            lock_path: lock_path.display().to_string(),
        }
    }

    fn lock_io(lock_path: &Path, message: impl Into<String>) -> Self {
        Self::LockIo {
            lock_path: lock_path.display().to_string(),
            message: message.into(),
        }
    }
}

impl<E: Display> Display for AtomicStoreMutationError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockBusy { lock_path } => write!(f, "collision lock busy: {lock_path}"),
            Self::LockIo { lock_path, message } => {
                write!(f, "failed to acquire collision lock {lock_path}: {message}")
            }
            Self::Store(err) => write!(f, "{err}"),
            Self::Mutation(err) => write!(f, "{err}"),
        }
    }
}

impl<E> StdError for AtomicStoreMutationError<E> where
    E: Display + std::fmt::Debug + StdError + 'static
{
}

impl From<AtomicStoreMutationError<CollisionStoreError>> for CollisionStoreError {
    fn from(err: AtomicStoreMutationError<CollisionStoreError>) -> Self {
        match err {
            AtomicStoreMutationError::LockBusy { lock_path } => Self::LockBusy { lock_path },
            AtomicStoreMutationError::LockIo { lock_path, message } => {
                Self::LockIo { lock_path, message }
            }
            AtomicStoreMutationError::Store(err) | AtomicStoreMutationError::Mutation(err) => err,
        }
    }
}

/// Execute one lock-scoped mutation against a collisions JSONL path.
///
/// The mutator returns `(value, changed)` where:
/// - `value` is returned to the caller
/// - `changed=true` persists the table before the lock is released.
pub fn mutate_table_jsonl<T, E, F>(
    path: impl AsRef<Path>,
    policy: LockPolicy,
    mutator: F,
) -> Result<T, AtomicStoreMutationError<E>>
where
    F: FnOnce(&mut CollisionTable) -> Result<(T, bool), E>,
{
    let path = path.as_ref();
    let _guard = CollisionFileLockGuard::acquire(path, policy)?;

    let mut table = CollisionTable::load_jsonl(path).map_err(AtomicStoreMutationError::Store)?;
    let (value, changed) = mutator(&mut table).map_err(AtomicStoreMutationError::Mutation)?;
    if changed {
        table
            .save_jsonl(path)
            .map_err(AtomicStoreMutationError::Store)?;
    }
    Ok(value)
}

struct CollisionFileLockGuard {
    lock_path: PathBuf,
    _file: File,
}

impl CollisionFileLockGuard {
    fn acquire<E>(path: &Path, policy: LockPolicy) -> Result<Self, AtomicStoreMutationError<E>> {
        let lock_path = collision_lock_path(path);
        if let Some(parent) = lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| AtomicStoreMutationError::lock_io(&lock_path, e.to_string()))?;
        }

        let deadline = Instant::now() + policy.wait;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(
                        file,
                        "pid={}\nutc={}",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    return Ok(Self {
                        lock_path,
                        _file: file,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_age(&lock_path).is_some_and(|age| age > policy.stale_after)
                        && take_over_stale_lock(&lock_path, policy.stale_after)
                    {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(AtomicStoreMutationError::lock_busy(&lock_path));
                    }
                    thread::sleep(policy.poll);
                }
                Err(err) => {
                    return Err(AtomicStoreMutationError::lock_io(
                        &lock_path,
                        err.to_string(),
                    ));
                }
            }
        }
    }
}

/// Age of the lock from its `utc=` stamp, falling back to the file mtime.
fn lock_age(lock_path: &Path) -> Option<Duration> {
    let stamped = fs::read_to_string(lock_path).ok().and_then(|text| {
        text.lines()
            .find_map(|line| line.strip_prefix("utc="))
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|at| at.with_timezone(&Utc))
    });
    match stamped {
        Some(at) => (Utc::now() - at).to_std().ok(),
        None => fs::metadata(lock_path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok()),
    }
}

/// Move a stale lock aside, then put it back if it turned out to be live.
///
/// Renaming is atomic, so two waiters never both remove the same lock; the
/// loser's rename fails with `NotFound` and it simply retries `create_new`.
/// Returns whether the caller should retry immediately.
fn take_over_stale_lock(lock_path: &Path, stale_after: Duration) -> bool {
    let mut aside: OsString = lock_path.as_os_str().to_os_string();
    aside.push(format!(
        ".stale-{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let aside = PathBuf::from(aside);
    if let Err(err) = fs::rename(lock_path, &aside) {
        return err.kind() == std::io::ErrorKind::NotFound;
    }
    if lock_age(&aside).is_some_and(|age| age > stale_after) {
        tracing::warn!(lock = %lock_path.display(), "took over stale collision lock");
    } else {
        // Another waiter replaced the stale lock first; hard_link restores it
        // only if the path is still free.
        let _ = fs::hard_link(&aside, lock_path);
    }
    let _ = fs::remove_file(&aside);
    true
}

impl Drop for CollisionFileLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_collisions_path(prefix: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "roadsense-store-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("temp dir should be created");
        root.join("collisions.jsonl")
    }

    #[test]
    fn busy_lock_fails_without_wait() {
        let path = temp_collisions_path("busy");
        let lock_path = collision_lock_path(&path);
        fs::write(&lock_path, "busy\n").expect("lock should be created");

        let result = mutate_table_jsonl::<(), CollisionStoreError, _>(
            &path,
            LockPolicy::NO_WAIT,
            |_| Ok(((), false)),
        );
        match result {
            Err(AtomicStoreMutationError::LockBusy { lock_path: reported }) => {
                assert_eq!(reported, lock_path.display().to_string());
            }
            other => panic!("expected lock busy error, got {other:?}"),
        }
        let _ = fs::remove_file(lock_path);
    }

    #[test]
    fn stale_lock_from_dead_holder_is_taken_over() {
        let path = temp_collisions_path("stale");
        let lock_path = collision_lock_path(&path);
        let stamp = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        fs::write(&lock_path, format!("pid=999999\nutc={stamp}\n")).expect("lock should be created");

        let result = mutate_table_jsonl::<usize, CollisionStoreError, _>(
            &path,
            LockPolicy::NO_WAIT,
            |table| Ok((table.len(), false)),
        );
        assert_eq!(result.expect("stale lock should be taken over"), 0);
        assert!(!lock_path.exists());
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".stale-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn fresh_stamp_is_not_stale() {
        let path = temp_collisions_path("fresh");
        let lock_path = collision_lock_path(&path);
        let stamp = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        fs::write(&lock_path, format!("pid=1\nutc={stamp}\n")).expect("lock should be created");

        let result = mutate_table_jsonl::<(), CollisionStoreError, _>(
            &path,
            LockPolicy::NO_WAIT,
            |_| Ok(((), false)),
        );
        assert!(matches!(result, Err(AtomicStoreMutationError::LockBusy { .. })));
        assert!(lock_path.exists());

        let short = LockPolicy::NO_WAIT.with_stale_after(Duration::from_secs(1));
        let result = mutate_table_jsonl::<(), CollisionStoreError, _>(&path, short, |_| Ok(((), false)));
        assert!(result.is_ok());
    }

    #[test]
    fn waiting_policy_outlasts_a_short_lived_lock() {
        let path = temp_collisions_path("wait");
        let lock_path = collision_lock_path(&path);
        fs::write(&lock_path, "busy\n").expect("lock should be created");

        let release = {
            let lock_path = lock_path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                fs::remove_file(lock_path).expect("lock should be removed");
            })
        };

        let result = mutate_table_jsonl::<usize, CollisionStoreError, _>(
            &path,
            LockPolicy::waiting(Duration::from_secs(5)),
            |table| Ok((table.len(), false)),
        );
        release.join().expect("release thread should join");
        assert_eq!(result.expect("mutation should run"), 0);
        assert!(!lock_path.exists());
    }

    #[test]
    fn concurrent_mutations_serialize() {
        use crate::collision::CollisionKey;
        use crate::table::UpsertRequest;
        use roadsense_geo::Position;

        let path = temp_collisions_path("serialize");
        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|idx| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mutate_table_jsonl::<(), CollisionStoreError, _>(
                        &path,
                        LockPolicy::waiting(Duration::from_secs(10)),
                        |table| {
                            let request = UpsertRequest {
                                key: CollisionKey::new(format!("s{idx}"), "r1"),
                                nearest_point: Position::new(18.0, 69.0),
                                distance_km: 0.0,
                                tolerance_km: 0.05,
                            };
                            table.upsert(&request, Utc::now())?;
                            Ok(((), true))
                        },
                    )
                    .expect("mutation should succeed");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker should join");
        }

        let table = CollisionTable::load_jsonl(&path).expect("reload");
        assert_eq!(table.len(), workers);
    }
}
