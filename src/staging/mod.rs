//! Staging store: the short-lived key/value state an album's recognition run
//! works in. Record layout follows the Redis deployment (hashes, lists and
//! plain strings with a TTL) so the key schema stays wire compatible.

pub mod album;
pub mod codec;
pub mod keys;
pub mod memory;
#[cfg(feature = "redis-staging")]
pub mod redis_store;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use album::{AlbumState, StagedFaceRef, StagedPattern, StagedPerson};
pub use memory::MemoryStore;
#[cfg(feature = "redis-staging")]
pub use redis_store::RedisStore;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging: key {0} holds a different record type")]
    WrongType(String),

    #[error("staging: malformed value in {key}.{field}: {message}")]
    Malformed { key: String, field: String, message: String },

    #[error("staging: storage error: {0}")]
    Storage(String),
}

pub type StagingResult<T> = Result<T, StagingError>;

/// Operations the pipeline needs from the staging backend.
///
/// Every write refreshes the record's TTL to the store default.
pub trait StagingStore: Send + Sync {
    fn get(&self, key: &str) -> StagingResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> StagingResult<()>;
    fn incr_by(&self, key: &str, by: i64) -> StagingResult<i64>;

    fn hget(&self, key: &str, field: &str) -> StagingResult<Option<Vec<u8>>>;
    fn hset(&self, key: &str, field: &str, value: &[u8]) -> StagingResult<()>;
    fn hdel(&self, key: &str, field: &str) -> StagingResult<bool>;
    fn hexists(&self, key: &str, field: &str) -> StagingResult<bool>;
    fn hgetall(&self, key: &str) -> StagingResult<Vec<(String, Vec<u8>)>>;
    fn hincr_by(&self, key: &str, field: &str, by: i64) -> StagingResult<i64>;

    fn rpush(&self, key: &str, value: &[u8]) -> StagingResult<usize>;
    fn lrange(&self, key: &str) -> StagingResult<Vec<Vec<u8>>>;
    fn lpos(&self, key: &str, value: &[u8]) -> StagingResult<Option<usize>>;
    fn lrem(&self, key: &str, value: &[u8]) -> StagingResult<usize>;

    fn exists(&self, key: &str) -> StagingResult<bool>;
    fn delete(&self, key: &str) -> StagingResult<bool>;
    /// Delete every key starting with `prefix`; returns how many went away.
    fn delete_prefix(&self, prefix: &str) -> StagingResult<usize>;
    /// Live keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> StagingResult<Vec<String>>;
    fn expire(&self, key: &str, ttl: Duration) -> StagingResult<bool>;

    fn get_str(&self, key: &str) -> StagingResult<Option<String>> {
        Ok(self.get(key)?.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn get_i64(&self, key: &str) -> StagingResult<Option<i64>> {
        match self.get_str(key)? {
            Some(s) => s.parse().map(Some).map_err(|_| StagingError::Malformed {
                key: key.to_string(),
                field: String::new(),
                message: format!("not an integer: {:?}", s),
            }),
            None => Ok(None),
        }
    }

    fn hget_str(&self, key: &str, field: &str) -> StagingResult<Option<String>> {
        Ok(self.hget(key, field)?.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn hget_i64(&self, key: &str, field: &str) -> StagingResult<Option<i64>> {
        match self.hget_str(key, field)? {
            Some(s) => s.parse().map(Some).map_err(|_| StagingError::Malformed {
                key: key.to_string(),
                field: field.to_string(),
                message: format!("not an integer: {:?}", s),
            }),
            None => Ok(None),
        }
    }

    fn hset_str(&self, key: &str, field: &str, value: &str) -> StagingResult<()> {
        self.hset(key, field, value.as_bytes())
    }

    fn hset_i64(&self, key: &str, field: &str, value: i64) -> StagingResult<()> {
        self.hset(key, field, value.to_string().as_bytes())
    }
}

impl fmt::Debug for dyn StagingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StagingStore {{ ... }}")
    }
}
