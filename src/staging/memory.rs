//! In-process staging store with per-key expiry.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{StagingError, StagingResult, StagingStore};

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    List(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Record {
    value: Value,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Record>>>,
    ttl: Duration,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop every expired record; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.lock();
        let before = data.len();
        data.retain(|_, r| r.expires_at > now);
        before - data.len()
    }

    fn live<'a>(data: &'a mut HashMap<String, Record>, key: &str) -> Option<&'a mut Record> {
        let now = Instant::now();
        if data.get(key).map(|r| r.expires_at <= now).unwrap_or(false) {
            data.remove(key);
        }
        data.get_mut(key)
    }

    fn hash_mut<'a>(
        &self,
        data: &'a mut HashMap<String, Record>,
        key: &str,
    ) -> StagingResult<&'a mut BTreeMap<String, Vec<u8>>> {
        let expires_at = Instant::now() + self.ttl;
        if Self::live(data, key).is_none() {
            data.insert(
                key.to_string(),
                Record { value: Value::Hash(BTreeMap::new()), expires_at },
            );
        }
        let rec = data.get_mut(key).ok_or_else(|| StagingError::Storage(key.to_string()))?;
        rec.expires_at = expires_at;
        match &mut rec.value {
            Value::Hash(h) => Ok(h),
            _ => Err(StagingError::WrongType(key.to_string())),
        }
    }

    fn list_mut<'a>(&self, data: &'a mut HashMap<String, Record>, key: &str) -> StagingResult<&'a mut Vec<Vec<u8>>> {
        let expires_at = Instant::now() + self.ttl;
        if Self::live(data, key).is_none() {
            data.insert(
                key.to_string(),
                Record { value: Value::List(Vec::new()), expires_at },
            );
        }
        let rec = data.get_mut(key).ok_or_else(|| StagingError::Storage(key.to_string()))?;
        rec.expires_at = expires_at;
        match &mut rec.value {
            Value::List(l) => Ok(l),
            _ => Err(StagingError::WrongType(key.to_string())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl StagingStore for MemoryStore {
    fn get(&self, key: &str) -> StagingResult<Option<Vec<u8>>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(None),
            Some(Record { value: Value::Str(v), .. }) => Ok(Some(v.clone())),
            Some(_) => Err(StagingError::WrongType(key.to_string())),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StagingResult<()> {
        let mut data = self.data.lock();
        data.insert(
            key.to_string(),
            Record { value: Value::Str(value.to_vec()), expires_at: Instant::now() + self.ttl },
        );
        Ok(())
    }

    fn incr_by(&self, key: &str, by: i64) -> StagingResult<i64> {
        let mut data = self.data.lock();
        let current = match Self::live(&mut data, key) {
            None => 0,
            Some(Record { value: Value::Str(v), .. }) => std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| StagingError::Malformed {
                    key: key.to_string(),
                    field: String::new(),
                    message: "not an integer".to_string(),
                })?,
            Some(_) => return Err(StagingError::WrongType(key.to_string())),
        };
        let next = current + by;
        data.insert(
            key.to_string(),
            Record { value: Value::Str(next.to_string().into_bytes()), expires_at: Instant::now() + self.ttl },
        );
        Ok(next)
    }

    fn hget(&self, key: &str, field: &str) -> StagingResult<Option<Vec<u8>>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(None),
            Some(Record { value: Value::Hash(h), .. }) => Ok(h.get(field).cloned()),
            Some(_) => Err(StagingError::WrongType(key.to_string())),
        }
    }

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> StagingResult<()> {
        let mut data = self.data.lock();
        self.hash_mut(&mut data, key)?.insert(field.to_string(), value.to_vec());
        Ok(())
    }

    fn hdel(&self, key: &str, field: &str) -> StagingResult<bool> {
        let mut data = self.data.lock();
        let (removed, now_empty) = match Self::live(&mut data, key) {
            None => return Ok(false),
            Some(Record { value: Value::Hash(h), .. }) => {
                let removed = h.remove(field).is_some();
                (removed, h.is_empty())
            }
            Some(_) => return Err(StagingError::WrongType(key.to_string())),
        };
        // Redis drops a hash once its last field is gone.
        if now_empty {
            data.remove(key);
        }
        Ok(removed)
    }

    fn hexists(&self, key: &str, field: &str) -> StagingResult<bool> {
        Ok(self.hget(key, field)?.is_some())
    }

    fn hgetall(&self, key: &str) -> StagingResult<Vec<(String, Vec<u8>)>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Record { value: Value::Hash(h), .. }) => {
                Ok(h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            Some(_) => Err(StagingError::WrongType(key.to_string())),
        }
    }

    fn hincr_by(&self, key: &str, field: &str, by: i64) -> StagingResult<i64> {
        let mut data = self.data.lock();
        let h = self.hash_mut(&mut data, key)?;
        let current = match h.get(field) {
            None => 0,
            Some(v) => std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| StagingError::Malformed {
                    key: key.to_string(),
                    field: field.to_string(),
                    message: "not an integer".to_string(),
                })?,
        };
        let next = current + by;
        h.insert(field.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    fn rpush(&self, key: &str, value: &[u8]) -> StagingResult<usize> {
        let mut data = self.data.lock();
        let list = self.list_mut(&mut data, key)?;
        list.push(value.to_vec());
        Ok(list.len())
    }

    fn lrange(&self, key: &str) -> StagingResult<Vec<Vec<u8>>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Record { value: Value::List(l), .. }) => Ok(l.clone()),
            Some(_) => Err(StagingError::WrongType(key.to_string())),
        }
    }

    fn lpos(&self, key: &str, value: &[u8]) -> StagingResult<Option<usize>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(None),
            Some(Record { value: Value::List(l), .. }) => Ok(l.iter().position(|v| v == value)),
            Some(_) => Err(StagingError::WrongType(key.to_string())),
        }
    }

    fn lrem(&self, key: &str, value: &[u8]) -> StagingResult<usize> {
        let mut data = self.data.lock();
        let (removed, now_empty) = match Self::live(&mut data, key) {
            None => return Ok(0),
            Some(Record { value: Value::List(l), .. }) => {
                let before = l.len();
                l.retain(|v| v != value);
                (before - l.len(), l.is_empty())
            }
            Some(_) => return Err(StagingError::WrongType(key.to_string())),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(removed)
    }

    fn exists(&self, key: &str) -> StagingResult<bool> {
        let mut data = self.data.lock();
        Ok(Self::live(&mut data, key).is_some())
    }

    fn delete(&self, key: &str) -> StagingResult<bool> {
        let mut data = self.data.lock();
        let was_live = Self::live(&mut data, key).is_some();
        data.remove(key);
        Ok(was_live)
    }

    fn delete_prefix(&self, prefix: &str) -> StagingResult<usize> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let doomed: Vec<String> = data.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        let mut live = 0;
        for k in doomed {
            if let Some(r) = data.remove(&k) {
                if r.expires_at > now {
                    live += 1;
                }
            }
        }
        Ok(live)
    }

    fn keys(&self, prefix: &str) -> StagingResult<Vec<String>> {
        let now = Instant::now();
        let data = self.data.lock();
        let mut out: Vec<String> = data
            .iter()
            .filter(|(k, r)| k.starts_with(prefix) && r.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StagingResult<bool> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            Some(rec) => {
                rec.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
