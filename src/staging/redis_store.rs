//! Redis-backed staging store. Records keep the deployed key schema, so a
//! run can be resumed by any process sharing the server.

use parking_lot::Mutex;
use redis::{Client, Connection, RedisError, RedisResult};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{StagingError, StagingResult, StagingStore};

const SCAN_BATCH: usize = 500;

/// `MATCH` pattern for every key starting with `prefix`.
pub fn scan_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

pub struct RedisStore {
    client: Client,
    conn: Mutex<Option<Connection>>,
    ttl: Duration,
}

impl RedisStore {
    /// Connects eagerly so a bad URL fails at startup.
    pub fn open(url: &str, ttl: Duration) -> StagingResult<Self> {
        let client = Client::open(url).map_err(|e| StagingError::Storage(e.to_string()))?;
        let conn = client.get_connection().map_err(|e| StagingError::Storage(e.to_string()))?;
        Ok(Self { client, conn: Mutex::new(Some(conn)), ttl })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    /// Run `f` on the shared connection, reconnecting once it was dropped.
    fn with_conn<T>(&self, key: &str, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> StagingResult<T> {
        let mut slot = self.conn.lock();
        if slot.is_none() {
            debug!("reconnecting to redis");
            *slot = Some(self.client.get_connection().map_err(|e| StagingError::Storage(e.to_string()))?);
        }
        let conn = slot.as_mut().ok_or_else(|| StagingError::Storage("no redis connection".to_string()))?;
        f(conn).map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                warn!("redis connection lost: {}", e);
                *slot = None;
            }
            map_error(key, e)
        })
    }

    fn scan(&self, prefix: &str) -> StagingResult<Vec<String>> {
        let pattern = scan_pattern(prefix);
        self.with_conn(prefix, |conn| {
            let mut cursor = 0u64;
            let mut found = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query(conn)?;
                found.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(found)
        })
    }
}

fn map_error(key: &str, e: RedisError) -> StagingError {
    if e.code() == Some("WRONGTYPE") {
        StagingError::WrongType(key.to_string())
    } else {
        StagingError::Storage(format!("{}: {}", key, e))
    }
}

impl StagingStore for RedisStore {
    fn get(&self, key: &str) -> StagingResult<Option<Vec<u8>>> {
        self.with_conn(key, |conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: &[u8]) -> StagingResult<()> {
        let ttl = self.ttl_ms();
        self.with_conn(key, |conn| redis::cmd("SET").arg(key).arg(value).arg("PX").arg(ttl).query(conn))
    }

    fn incr_by(&self, key: &str, by: i64) -> StagingResult<i64> {
        let ttl = self.ttl_ms();
        let (n,): (i64,) = self.with_conn(key, |conn| {
            redis::pipe()
                .atomic()
                .cmd("INCRBY")
                .arg(key)
                .arg(by)
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl)
                .ignore()
                .query(conn)
        })?;
        Ok(n)
    }

    fn hget(&self, key: &str, field: &str) -> StagingResult<Option<Vec<u8>>> {
        self.with_conn(key, |conn| redis::cmd("HGET").arg(key).arg(field).query(conn))
    }

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> StagingResult<()> {
        let ttl = self.ttl_ms();
        self.with_conn(key, |conn| {
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl)
                .ignore()
                .query(conn)
        })
    }

    fn hdel(&self, key: &str, field: &str) -> StagingResult<bool> {
        let removed: i64 = self.with_conn(key, |conn| redis::cmd("HDEL").arg(key).arg(field).query(conn))?;
        Ok(removed > 0)
    }

    fn hexists(&self, key: &str, field: &str) -> StagingResult<bool> {
        self.with_conn(key, |conn| redis::cmd("HEXISTS").arg(key).arg(field).query(conn))
    }

    fn hgetall(&self, key: &str) -> StagingResult<Vec<(String, Vec<u8>)>> {
        let fields: BTreeMap<String, Vec<u8>> = self.with_conn(key, |conn| redis::cmd("HGETALL").arg(key).query(conn))?;
        Ok(fields.into_iter().collect())
    }

    fn hincr_by(&self, key: &str, field: &str, by: i64) -> StagingResult<i64> {
        let ttl = self.ttl_ms();
        let (n,): (i64,) = self.with_conn(key, |conn| {
            redis::pipe()
                .atomic()
                .cmd("HINCRBY")
                .arg(key)
                .arg(field)
                .arg(by)
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl)
                .ignore()
                .query(conn)
        })?;
        Ok(n)
    }

    fn rpush(&self, key: &str, value: &[u8]) -> StagingResult<usize> {
        let ttl = self.ttl_ms();
        let (len,): (usize,) = self.with_conn(key, |conn| {
            redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(key)
                .arg(value)
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl)
                .ignore()
                .query(conn)
        })?;
        Ok(len)
    }

    fn lrange(&self, key: &str) -> StagingResult<Vec<Vec<u8>>> {
        self.with_conn(key, |conn| redis::cmd("LRANGE").arg(key).arg(0).arg(-1).query(conn))
    }

    fn lpos(&self, key: &str, value: &[u8]) -> StagingResult<Option<usize>> {
        self.with_conn(key, |conn| redis::cmd("LPOS").arg(key).arg(value).query(conn))
    }

    fn lrem(&self, key: &str, value: &[u8]) -> StagingResult<usize> {
        self.with_conn(key, |conn| redis::cmd("LREM").arg(key).arg(0).arg(value).query(conn))
    }

    fn exists(&self, key: &str) -> StagingResult<bool> {
        self.with_conn(key, |conn| redis::cmd("EXISTS").arg(key).query(conn))
    }

    fn delete(&self, key: &str) -> StagingResult<bool> {
        let removed: i64 = self.with_conn(key, |conn| redis::cmd("DEL").arg(key).query(conn))?;
        Ok(removed > 0)
    }

    fn delete_prefix(&self, prefix: &str) -> StagingResult<usize> {
        let doomed = self.keys(prefix)?;
        let mut removed = 0usize;
        for chunk in doomed.chunks(SCAN_BATCH) {
            let n: usize = self.with_conn(prefix, |conn| redis::cmd("DEL").arg(chunk).query(conn))?;
            removed += n;
        }
        Ok(removed)
    }

    fn keys(&self, prefix: &str) -> StagingResult<Vec<String>> {
        let mut keys = self.scan(prefix)?;
        // SCAN may report a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StagingResult<bool> {
        let ms = ttl.as_millis() as u64;
        self.with_conn(key, |conn| redis::cmd("PEXPIRE").arg(key).arg(ms).query(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_pattern_escapes_globs() {
        assert_eq!(scan_pattern("album_1_"), "album_1_*");
        assert_eq!(scan_pattern("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[test]
    fn test_open_rejects_bad_url() {
        assert!(matches!(
            RedisStore::open("not a url", Duration::from_secs(1)),
            Err(StagingError::Storage(_))
        ));
    }

    fn live_store() -> RedisStore {
        let url = std::env::var("NAZR_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/15".to_string());
        RedisStore::open(&url, Duration::from_secs(30)).unwrap()
    }

    #[test]
    #[ignore = "needs a Redis server at NAZR_TEST_REDIS_URL"]
    fn test_records_against_server() {
        let store = live_store();
        let album = "album_990077";
        store.delete_prefix(album).unwrap();

        store.hset_i64(album, "current_stage", 3).unwrap();
        assert_eq!(store.hget_i64(album, "current_stage").unwrap(), Some(3));
        assert_eq!(store.hincr_by(album, "number_of_processed_photos", 2).unwrap(), 2);
        assert_eq!(store.hgetall(album).unwrap().len(), 2);

        let photos = "album_990077_photos";
        store.rpush(photos, b"a").unwrap();
        store.rpush(photos, b"b").unwrap();
        assert_eq!(store.lpos(photos, b"b").unwrap(), Some(1));
        assert_eq!(store.lrem(photos, b"a").unwrap(), 1);
        assert_eq!(store.lrange(photos).unwrap(), vec![b"b".to_vec()]);

        store.set("album_990077_finished", b"1").unwrap();
        assert!(matches!(store.hget("album_990077_finished", "f"), Err(StagingError::WrongType(_))));
        assert_eq!(store.incr_by("album_990077_counter", 4).unwrap(), 4);

        assert_eq!(
            store.keys("album_990077_").unwrap(),
            vec!["album_990077_counter", "album_990077_finished", "album_990077_photos"]
        );
        assert_eq!(store.delete_prefix("album_990077_").unwrap(), 3);
        assert!(store.delete(album).unwrap());
        assert!(!store.exists(album).unwrap());
    }
}
