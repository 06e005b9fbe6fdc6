use async_trait::async_trait;
use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};

/// Maps a dedup key to the task id first issued for it.
#[async_trait]
pub trait DedupIndex: Send + Sync {
    /// Atomically returns the id already stored under `key`, or stores
    /// `task_id`. The flag is `true` when the key existed.
    async fn lookup_or_reserve(&self, key: &str, task_id: &str) -> Result<(String, bool)>;
    /// Drops `key` only while it still points at `task_id`.
    async fn release(&self, key: &str, task_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryDedupIndex {
    entries: DashMap<String, String>,
}

impl InMemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupIndex for InMemoryDedupIndex {
    async fn lookup_or_reserve(&self, key: &str, task_id: &str) -> Result<(String, bool)> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), true)),
            Entry::Vacant(slot) => {
                slot.insert(task_id.to_string());
                Ok((task_id.to_string(), false))
            }
        }
    }

    async fn release(&self, key: &str, task_id: &str) -> Result<()> {
        self.entries.remove_if(key, |_, owner| owner == task_id);
        Ok(())
    }
}

/// Content-derived key: hex SHA-256 of the payload bytes.
pub fn content_key(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Key built from two caller-supplied identifiers.
pub fn composite_key(first: &str, second: &str) -> String {
    format!("{}:{}", first, second)
}

/// Dedup key for a submission: the explicit key, the content hash, or both
/// joined when a caller scopes an upload under its own key.
pub fn derive_key(explicit: Option<&str>, content: Option<&[u8]>) -> Option<String> {
    match (explicit, content) {
        (Some(key), Some(bytes)) => Some(composite_key(key, &content_key(bytes))),
        (None, Some(bytes)) => Some(content_key(bytes)),
        (Some(key), None) => Some(key.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_reservation_wins() {
        let index = InMemoryDedupIndex::new();
        assert_eq!(
            index.lookup_or_reserve("k", "t1").await.unwrap(),
            ("t1".to_string(), false)
        );
        assert_eq!(
            index.lookup_or_reserve("k", "t2").await.unwrap(),
            ("t1".to_string(), true)
        );
    }

    #[tokio::test]
    async fn release_only_drops_own_reservation() {
        let index = InMemoryDedupIndex::new();
        index.lookup_or_reserve("k", "t1").await.unwrap();

        index.release("k", "t2").await.unwrap();
        assert_eq!(index.lookup_or_reserve("k", "t3").await.unwrap(), ("t1".to_string(), true));

        index.release("k", "t1").await.unwrap();
        assert_eq!(index.lookup_or_reserve("k", "t3").await.unwrap(), ("t3".to_string(), false));
    }

    #[tokio::test]
    async fn concurrent_reservations_agree() {
        let index = Arc::new(InMemoryDedupIndex::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index.lookup_or_reserve("shared", &format!("t{}", i)).await.unwrap()
            }));
        }

        let mut winners = 0;
        let mut ids = Vec::new();
        for h in handles {
            let (id, existed) = h.await.unwrap();
            if !existed {
                winners += 1;
            }
            ids.push(id);
        }
        assert_eq!(winners, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn key_derivation() {
        assert_eq!(
            content_key(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(content_key(b"abc"), content_key(b"abc"));
        assert_eq!(composite_key("img", "3"), "img:3");
    }

    #[test]
    fn derived_keys() {
        let digest = content_key(b"abc");
        assert_eq!(derive_key(None, None), None);
        assert_eq!(derive_key(Some("user-1"), None).as_deref(), Some("user-1"));
        assert_eq!(derive_key(None, Some(b"abc")), Some(digest.clone()));
        assert_eq!(derive_key(Some("user-1"), Some(b"abc")), Some(format!("user-1:{}", digest)));
        assert_ne!(derive_key(None, Some(b"abc")), derive_key(None, Some(b"abd")));
    }
}
