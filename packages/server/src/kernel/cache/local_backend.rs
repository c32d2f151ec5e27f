use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::backend::{CacheBackend, CacheError};

/// In-process backend.
///
/// Suitable for single-node deployments and tests. Contents are lost on
/// restart, so the auto-record queue is not durable on this backend.
#[derive(Default)]
pub struct LocalBackend {
    store: DashMap<String, (Vec<u8>, Option<Instant>)>,
    zsets: DashMap<String, Vec<(f64, String)>>,
    lists: DashMap<String, VecDeque<String>>,
    sets: DashMap<String, BTreeSet<String>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(expires_at: &Option<Instant>, now: Instant) -> bool {
        expires_at.map_or(true, |exp| now <= exp)
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.store.get(key) {
            let (value, expires_at) = entry.value();
            if Self::is_live(expires_at, now) {
                return Ok(Some(value.clone()));
            }
            // Lazy deletion of the expired entry.
            drop(entry);
            self.store.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.store.insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(key);
        self.zsets.remove(key);
        self.lists.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let before = self.store.len() + self.zsets.len() + self.lists.len() + self.sets.len();
        self.store.retain(|key, _| !key.starts_with(prefix));
        self.zsets.retain(|key, _| !key.starts_with(prefix));
        self.lists.retain(|key, _| !key.starts_with(prefix));
        self.sets.retain(|key, _| !key.starts_with(prefix));
        let after = self.store.len() + self.zsets.len() + self.lists.len() + self.sets.len();
        Ok(before.saturating_sub(after) as u64)
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, CacheError> {
        let now = Instant::now();
        let expires_at = ttl.map(|d| now + d);

        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if Self::is_live(&occupied.get().1, now) {
                    return Ok(false);
                }
                occupied.insert((value.to_vec(), expires_at));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_vec(), expires_at));
                Ok(true)
            }
        }
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let now = Instant::now();
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (value, expires_at) = occupied.get();
                if !Self::is_live(expires_at, now) {
                    occupied.insert((delta.to_string().into_bytes(), ttl.map(|d| now + d)));
                    return Ok(delta);
                }
                let current = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| CacheError::Backend(format!("value at {} is not an integer", key)))?;
                let next = current + delta;
                let expires_at = *expires_at;
                occupied.insert((next.to_string().into_bytes(), expires_at));
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert((delta.to_string().into_bytes(), ttl.map(|d| now + d)));
                Ok(delta)
            }
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, CacheError> {
        let mut entry = self.zsets.entry(key.to_string()).or_default();
        let members = entry.value_mut();

        let existed = match members.iter().position(|(_, m)| m == member) {
            Some(pos) => {
                members.remove(pos);
                true
            }
            None => false,
        };
        // Stable insert keeps equal scores in arrival order.
        let pos = members.partition_point(|(s, _)| *s <= score);
        members.insert(pos, (score, member.to_string()));
        Ok(!existed)
    }

    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>, CacheError> {
        Ok(self
            .zsets
            .get(key)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .take_while(|(score, _)| *score <= max)
                    .take(limit)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        Ok(self.zsets.get(key).and_then(|entry| {
            entry
                .value()
                .iter()
                .find(|(_, m)| m == member)
                .map(|(score, _)| *score)
        }))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        if let Some(mut entry) = self.zsets.get_mut(key) {
            let members = entry.value_mut();
            if let Some(pos) = members.iter().position(|(_, m)| m == member) {
                members.remove(pos);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self.zsets.get(key).map_or(0, |e| e.value().len() as u64))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, CacheError> {
        let mut entry = self.lists.entry(key.to_string()).or_default();
        entry.value_mut().push_back(value.to_string());
        Ok(entry.value().len() as u64)
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, CacheError> {
        let Some(mut entry) = self.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let list = entry.value_mut();
        let take = count.min(list.len());
        Ok(list.drain(..take).collect())
    }

    async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self.lists.get(key).map_or(0, |e| e.value().len() as u64))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .value_mut()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        Ok(self
            .sets
            .get_mut(key)
            .map_or(false, |mut e| e.value_mut().remove(member)))
    }

    async fn spop(&self, key: &str, count: usize) -> Result<Vec<String>, CacheError> {
        let Some(mut entry) = self.sets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let set = entry.value_mut();
        let mut popped = Vec::with_capacity(count.min(set.len()));
        while popped.len() < count {
            match set.pop_first() {
                Some(member) => popped.push(member),
                None => break,
            }
        }
        Ok(popped)
    }

    async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self.sets.get(key).map_or(0, |e| e.value().len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_values_read_as_missing() {
        let backend = LocalBackend::new();
        backend
            .set("k", b"v", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn del_prefix_only_touches_matching_keys() {
        let backend = LocalBackend::new();
        backend.set("pending-jobs::all", b"1", None).await.unwrap();
        backend.set("pending-jobs::shop", b"1", None).await.unwrap();
        backend.set("job::1", b"1", None).await.unwrap();

        assert_eq!(backend.del_prefix("pending-jobs::").await.unwrap(), 2);
        assert!(backend.get("job::1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn del_removes_every_kind_of_key() {
        let backend = LocalBackend::new();
        backend.set("k", b"v", None).await.unwrap();
        backend.zadd("k", 1.0, "a").await.unwrap();
        backend.rpush("k", "a").await.unwrap();
        backend.sadd("k", "a").await.unwrap();

        backend.del("k").await.unwrap();

        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.zcard("k").await.unwrap(), 0);
        assert_eq!(backend.llen("k").await.unwrap(), 0);
        assert_eq!(backend.scard("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_nx_refuses_live_keys() {
        let backend = LocalBackend::new();
        assert!(backend.set_nx("lock", b"a", None).await.unwrap());
        assert!(!backend.set_nx("lock", b"b", None).await.unwrap());
        backend.del("lock").await.unwrap();
        assert!(backend.set_nx("lock", b"c", None).await.unwrap());
    }

    #[tokio::test]
    async fn sorted_set_returns_due_members_in_score_order() {
        let backend = LocalBackend::new();
        backend.zadd("idx", 30.0, "c").await.unwrap();
        backend.zadd("idx", 10.0, "a").await.unwrap();
        backend.zadd("idx", 20.0, "b").await.unwrap();
        // Re-adding moves the member instead of duplicating it.
        assert!(!backend.zadd("idx", 40.0, "a").await.unwrap());

        assert_eq!(backend.zrange_by_score("idx", 35.0, 10).await.unwrap(), vec!["b", "c"]);
        assert_eq!(backend.zrange_by_score("idx", 35.0, 1).await.unwrap(), vec!["b"]);
        assert_eq!(backend.zscore("idx", "a").await.unwrap(), Some(40.0));
        assert_eq!(backend.zcard("idx").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn lists_are_fifo() {
        let backend = LocalBackend::new();
        for v in ["1", "2", "3"] {
            backend.rpush("q", v).await.unwrap();
        }
        assert_eq!(backend.lpop("q", 2).await.unwrap(), vec!["1", "2"]);
        assert_eq!(backend.llen("q").await.unwrap(), 1);
        assert_eq!(backend.lpop("q", 5).await.unwrap(), vec!["3"]);
        assert!(backend.lpop("missing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counters_start_at_delta() {
        let backend = LocalBackend::new();
        assert_eq!(backend.incr("c", 1, None).await.unwrap(), 1);
        assert_eq!(backend.incr("c", 2, None).await.unwrap(), 3);
    }
}
