//! Persistent TTL cache over sqlite.
//!
//! Keys are canonicalized lookup queries, values are already-sanitized
//! projections, so everything stored here is safe to replay to users.
//! Entries expire on read: a `get` that observes a stale row deletes it
//! before reporting a miss.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};

/// A cached projection together with its insertion time (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Sanitized projection text.
    pub value: String,
    /// Unix seconds at insert/update time.
    pub created_at: i64,
}

/// TTL key/value store backed by a single sqlite file.
///
/// All operations run on the blocking pool and serialize through one mutex;
/// concurrent callers observe each operation atomically. A TTL of zero or
/// less disables expiry.
pub struct SqliteTtlCache {
    conn: Arc<Mutex<Option<Connection>>>,
    ttl_seconds: i64,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SqliteTtlCache {
    /// Opens (or creates) the cache database at `path`.
    pub fn open(path: &Path, ttl_seconds: i64) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        // journal_mode reports the resulting mode as a row, so query it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            ttl_seconds,
        })
    }

    /// Looks up `key`, expiring the entry first if it is older than the TTL.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        let conn = self.conn.clone();
        let ttl = self.ttl_seconds;
        let key = key.to_owned();
        run_blocking(move || {
            let guard = lock(&conn)?;
            let db = open_conn(&guard)?;
            let row = db
                .query_row(
                    "SELECT v, created_at FROM cache WHERE k = ?1",
                    params![key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            let Some((value, created_at)) = row else {
                return Ok(None);
            };
            if ttl > 0 && now_unix() - created_at > ttl {
                db.execute("DELETE FROM cache WHERE k = ?1", params![key])?;
                return Ok(None);
            }
            Ok(Some(CacheEntry { value, created_at }))
        })
        .await
    }

    /// Inserts or refreshes `key` with `value` at the current time.
    pub async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        let key = key.to_owned();
        let value = value.to_owned();
        run_blocking(move || {
            let guard = lock(&conn)?;
            let db = open_conn(&guard)?;
            db.execute(
                "INSERT INTO cache(k, v, created_at) VALUES(?1, ?2, ?3)
                 ON CONFLICT(k) DO UPDATE SET v = excluded.v, created_at = excluded.created_at",
                params![key, value, now_unix()],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes every entry older than the TTL, returning how many were removed.
    ///
    /// No-op when expiry is disabled.
    pub async fn purge_expired(&self) -> anyhow::Result<usize> {
        if self.ttl_seconds <= 0 {
            return Ok(0);
        }
        let conn = self.conn.clone();
        let cutoff = now_unix() - self.ttl_seconds;
        run_blocking(move || {
            let guard = lock(&conn)?;
            let db = open_conn(&guard)?;
            Ok(db.execute("DELETE FROM cache WHERE created_at < ?1", params![cutoff])?)
        })
        .await
    }

    /// Releases the underlying database. Later operations fail.
    pub async fn close(&self) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        run_blocking(move || {
            let mut guard = lock(&conn)?;
            if let Some(db) = guard.take() {
                db.close().map_err(|(_, err)| anyhow::Error::from(err))?;
            }
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T: Send + 'static>(
    op: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> anyhow::Result<T> {
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| anyhow::anyhow!("cache task join error: {err:#}"))?
}

fn lock(conn: &Mutex<Option<Connection>>) -> anyhow::Result<std::sync::MutexGuard<'_, Option<Connection>>> {
    conn.lock()
        .map_err(|_| anyhow::anyhow!("cache mutex poisoned"))
}

fn open_conn<'a>(
    guard: &'a std::sync::MutexGuard<'_, Option<Connection>>,
) -> anyhow::Result<&'a Connection> {
    guard
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("cache is closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(ttl: i64) -> (tempfile::TempDir, SqliteTtlCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteTtlCache::open(&dir.path().join("cache.db"), ttl).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn round_trip_within_ttl() {
        let (_dir, cache) = open_temp(3600);
        cache.set("inn:1|fio:a", "safe").await.unwrap();
        let entry = cache.get("inn:1|fio:a").await.unwrap().unwrap();
        assert_eq!(entry.value, "safe");
        assert!(entry.created_at <= now_unix());
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let (_dir, cache) = open_temp(3600);
        assert!(cache.get("inn:404|fio:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_is_upsert() {
        let (_dir, cache) = open_temp(3600);
        cache.set("k", "old").await.unwrap();
        cache.set("k", "new").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().unwrap().value, "new");
    }

    #[tokio::test]
    async fn expired_entry_is_deleted_on_read() {
        let (dir, cache) = open_temp(60);
        cache.set("k", "v").await.unwrap();

        // Backdate the row past the TTL through a second connection.
        let raw = Connection::open(dir.path().join("cache.db")).unwrap();
        raw.execute(
            "UPDATE cache SET created_at = ?1",
            params![now_unix() - 120],
        )
        .unwrap();

        assert!(cache.get("k").await.unwrap().is_none());
        let left: i64 = raw
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn zero_ttl_disables_expiry() {
        let (dir, cache) = open_temp(0);
        cache.set("k", "v").await.unwrap();
        let raw = Connection::open(dir.path().join("cache.db")).unwrap();
        raw.execute(
            "UPDATE cache SET created_at = ?1",
            params![now_unix() - 999_999],
        )
        .unwrap();

        assert_eq!(cache.get("k").await.unwrap().unwrap().value, "v");
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_removes_only_stale_rows() {
        let (dir, cache) = open_temp(60);
        cache.set("fresh", "v").await.unwrap();
        cache.set("stale", "v").await.unwrap();
        let raw = Connection::open(dir.path().join("cache.db")).unwrap();
        raw.execute(
            "UPDATE cache SET created_at = ?1 WHERE k = 'stale'",
            params![now_unix() - 120],
        )
        .unwrap();

        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert!(cache.get("fresh").await.unwrap().is_some());
        assert!(cache.get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = SqliteTtlCache::open(&path, 3600).unwrap();
            cache.set("k", "v").await.unwrap();
            cache.close().await.unwrap();
        }
        let cache = SqliteTtlCache::open(&path, 3600).unwrap();
        assert_eq!(cache.get("k").await.unwrap().unwrap().value, "v");
    }

    #[tokio::test]
    async fn closed_cache_reports_errors() {
        let (_dir, cache) = open_temp(3600);
        cache.close().await.unwrap();
        assert!(cache.get("k").await.is_err());
        assert!(cache.set("k", "v").await.is_err());
    }
}
