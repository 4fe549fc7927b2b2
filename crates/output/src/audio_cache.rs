//! Short-lived audio cache
//!
//! Synthesized utterances destined for external media players are cached
//! under a stable identifier and served over HTTP; entries expire after
//! the configured TTL.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use hearth_core::AudioClip;

struct CachedAudio {
    clip: AudioClip,
    inserted_at: Instant,
}

/// Process-wide audio artifact cache
pub struct AudioCache {
    entries: DashMap<String, CachedAudio>,
    ttl: Duration,
}

impl AudioCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    /// Cache a clip, returning its identifier.
    pub fn put(&self, clip: AudioClip) -> String {
        self.purge_expired();
        let id = uuid::Uuid::new_v4().to_string();
        self.entries.insert(id.clone(), CachedAudio { clip, inserted_at: Instant::now() });
        id
    }

    /// Fetch a clip that has not expired yet.
    pub fn get(&self, id: &str) -> Option<AudioClip> {
        let entry = self.entries.get(id)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(id);
            return None;
        }
        Some(entry.clip.clone())
    }

    pub fn purge_expired(&self) {
        self.entries.retain(|_, v| v.inserted_at.elapsed() <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip() -> AudioClip {
        AudioClip { data: vec![1, 2, 3], mime_type: "audio/wav".to_string(), sample_rate: 22050 }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = AudioCache::new(Duration::from_secs(60));
        let id = cache.put(clip());
        let fetched = cache.get(&id).unwrap();
        assert_eq!(fetched.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_id() {
        let cache = AudioCache::new(Duration::from_secs(60));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = AudioCache::new(Duration::from_millis(0));
        let id = cache.put(clip());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }
}
