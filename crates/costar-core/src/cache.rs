//! Response cache, keyed by request URL.
//!
//! Memory tier (L1): a [`DashMap`] that lives as long as the process and never
//! expires anything. Disk tier (L2, optional): a SQLite table whose rows carry a
//! `stored_at` timestamp in epoch millis and go stale after the TTL.
//!
//! Lookups try L1, then L2; an L2 hit is copied into L1. A stale or
//! unparseable L2 row is deleted when read and counts as a miss. Inserts write
//! both tiers.
//!
//! L2 errors never reach callers. They are logged and treated as misses.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rusqlite::{Connection, OpenFlags, params};
use serde_json::Value;
use thiserror::Error;

/// Default time-to-live for persistent entries: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to open cache database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

/// WAL journal so readers never block the writer.
fn connect(path: &Path, read_only: bool) -> Result<Connection, rusqlite::Error> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// The single read-write connection. All L2 mutations go through it.
struct DiskStore {
    conn: Connection,
}

impl DiskStore {
    fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = connect(path, false)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS response_cache (
                 key        TEXT PRIMARY KEY NOT NULL,
                 data       TEXT NOT NULL,
                 stored_at  INTEGER NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    /// Insert or replace an entry. Returns `true` if the key was new.
    fn insert(&self, key: &str, data: &str, stored_at: i64) -> Result<bool, rusqlite::Error> {
        let existed = self
            .conn
            .query_row(
                "SELECT 1 FROM response_cache WHERE key = ?1",
                params![key],
                |_| Ok(()),
            )
            .is_ok();
        self.conn.execute(
            "INSERT OR REPLACE INTO response_cache (key, data, stored_at) VALUES (?1, ?2, ?3)",
            params![key, data, stored_at],
        )?;
        Ok(!existed)
    }

    fn delete(&self, key: &str) -> usize {
        self.conn
            .execute("DELETE FROM response_cache WHERE key = ?1", params![key])
            .unwrap_or(0)
    }

    fn clear(&self) {
        let _ = self.conn.execute("DELETE FROM response_cache", []);
        // Shrink the file too.
        let _ = self.conn.execute_batch("VACUUM");
    }

    fn evict_expired(&self, ttl: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(ttl.as_millis() as i64);
        self.conn
            .execute(
                "DELETE FROM response_cache WHERE stored_at < ?1",
                params![cutoff],
            )
            .unwrap_or(0)
    }

    fn count(&self) -> usize {
        self.conn
            .query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))
            .unwrap_or(0)
    }
}

/// Outcome of an L2 lookup.
enum DiskLookup {
    Hit(Value),
    Miss,
    /// Present but older than the TTL.
    Expired,
    /// Present but the payload does not parse.
    Corrupt,
}

/// Idle read-only connections, reused across lookups. A lookup that finds
/// none idle opens a fresh one.
struct ReaderPool {
    idle: Mutex<Vec<Connection>>,
    path: PathBuf,
}

impl ReaderPool {
    fn new(path: &Path) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            path: path.to_path_buf(),
        }
    }

    fn checkout(&self) -> Option<Connection> {
        if let Ok(mut idle) = self.idle.lock()
            && let Some(conn) = idle.pop()
        {
            return Some(conn);
        }
        connect(&self.path, true).ok()
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    fn get(&self, key: &str, ttl: Duration) -> DiskLookup {
        let Some(conn) = self.checkout() else {
            return DiskLookup::Miss;
        };
        let result = Self::query(&conn, key, ttl);
        self.checkin(conn);
        result
    }

    fn query(conn: &Connection, key: &str, ttl: Duration) -> DiskLookup {
        let Ok(mut stmt) =
            conn.prepare_cached("SELECT data, stored_at FROM response_cache WHERE key = ?1")
        else {
            return DiskLookup::Miss;
        };

        let row = stmt.query_row(params![key], |row| {
            let data: String = row.get(0)?;
            let stored_at: i64 = row.get(1)?;
            Ok((data, stored_at))
        });
        let Ok((data, stored_at)) = row else {
            return DiskLookup::Miss;
        };

        let age_ms = now_millis().saturating_sub(stored_at);
        if age_ms > ttl.as_millis() as i64 {
            return DiskLookup::Expired;
        }

        match serde_json::from_str(&data) {
            Ok(value) => DiskLookup::Hit(value),
            Err(_) => DiskLookup::Corrupt,
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Thread-safe two-tier cache keyed by request URL.
///
/// Reads of the disk tier go through a [`ReaderPool`]; writes are serialized
/// on one [`DiskStore`].
pub struct ResponseCache {
    memory: DashMap<String, Arc<Value>>,
    disk: Option<Mutex<DiskStore>>,
    readers: Option<ReaderPool>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    disk_count: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ResponseCache {
    /// Create an in-memory-only cache (no disk persistence).
    pub fn new(ttl: Duration) -> Self {
        Self {
            memory: DashMap::new(),
            disk: None,
            readers: None,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            disk_count: AtomicU64::new(0),
        }
    }

    /// Open a persistent cache backed by a SQLite database at `path`.
    ///
    /// On startup, expired rows are evicted. The L1 map starts empty and is
    /// populated lazily as entries are accessed.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self, CacheError> {
        let writer = DiskStore::open(path).map_err(|source| CacheError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let evicted = writer.evict_expired(ttl);
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired cache rows");
        }
        let count = writer.count();
        Ok(Self {
            memory: DashMap::new(),
            disk: Some(Mutex::new(writer)),
            readers: Some(ReaderPool::new(path)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            disk_count: AtomicU64::new(count as u64),
        })
    }

    /// Look up a cached payload.
    ///
    /// L2 is only consulted when `use_persistent` is set. An L2 hit is
    /// promoted into L1.
    pub fn get(&self, key: &str, use_persistent: bool) -> Option<Arc<Value>> {
        if let Some(value) = self.memory.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key, "cache L1 hit");
            return Some(Arc::clone(value.value()));
        }

        if use_persistent && let Some(ref pool) = self.readers {
            match pool.get(key, self.ttl) {
                DiskLookup::Hit(value) => {
                    tracing::trace!(key, "cache L2 hit, promoting to L1");
                    let value = Arc::new(value);
                    self.memory.insert(key.to_string(), Arc::clone(&value));
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                DiskLookup::Expired => {
                    tracing::trace!(key, "cache L2 entry expired");
                    self.delete_from_disk(key);
                }
                DiskLookup::Corrupt => {
                    tracing::debug!(key, "cache L2 entry unreadable, removing");
                    self.delete_from_disk(key);
                }
                DiskLookup::Miss => {}
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key, "cache miss");
        None
    }

    /// Look up L1 only, without touching hit/miss counters.
    pub fn peek_volatile(&self, key: &str) -> Option<Arc<Value>> {
        self.memory.get(key).map(|v| Arc::clone(v.value()))
    }

    /// Store a payload. L1 always; L2 too when `persist` is set.
    ///
    /// L2 write failures are logged and otherwise ignored.
    pub fn insert(&self, key: &str, value: Arc<Value>, persist: bool) {
        tracing::trace!(key, persist, "cache insert");
        if persist && let Some(ref disk) = self.disk {
            match serde_json::to_string(value.as_ref()) {
                Ok(data) => {
                    if let Ok(store) = disk.lock() {
                        match store.insert(key, &data, now_millis()) {
                            Ok(true) => {
                                self.disk_count.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(false) => {}
                            Err(e) => {
                                tracing::debug!(key, error = %e, "cache L2 write failed");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(key, error = %e, "cache payload not serializable");
                }
            }
        }
        self.memory.insert(key.to_string(), value);
    }

    fn delete_from_disk(&self, key: &str) {
        if let Some(ref disk) = self.disk
            && let Ok(store) = disk.lock()
            && store.delete(key) > 0
        {
            let _ = self
                .disk_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(1))
                });
        }
    }

    /// Drop everything, memory and disk.
    pub fn clear(&self) {
        self.memory.clear();
        if let Some(ref disk) = self.disk
            && let Ok(store) = disk.lock()
        {
            store.clear();
        }
        self.disk_count.store(0, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries held in memory.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Rows in the disk tier; 0 for a memory-only cache.
    pub fn disk_len(&self) -> usize {
        self.disk_count.load(Ordering::Relaxed) as usize
    }

    /// Whether a disk tier is attached.
    pub fn has_persistence(&self) -> bool {
        self.disk.is_some()
    }

    /// The persistent-tier TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("memory", &self.memory.len())
            .field("disk", &self.disk_len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .field("ttl", &self.ttl)
            .finish()
    }
}
