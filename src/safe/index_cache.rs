//! # Index Cache
//!
//! Decrypted search-index words, kept for a short idle period so repeated
//! searches do not decrypt the whole index again.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         INDEX CACHE                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  insert / get ──► touch (last_access = now)                            │
//! │                       │                                                 │
//! │                       ▼                                                 │
//! │  expiry task sleeps until last_access + ttl                            │
//! │        │                                                                │
//! │        ├── touched meanwhile ──► sleep again                           │
//! │        └── idle ──► clear (plaintext words zeroized)                   │
//! │                                                                         │
//! │  Accesses also check the deadline, so an expired cache is never        │
//! │  served even if the task has not run yet.                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::SafeId;

/// Encrypted index word as stored by the search index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexWordEntry {
    /// Entry identifier
    pub id: String,
    /// Word under the index key
    pub enc_word: Vec<u8>,
}

/// Decrypted index word
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PlainIndexWord {
    /// Entry identifier
    pub id: String,
    /// Plaintext word
    pub word: String,
}

impl std::fmt::Debug for PlainIndexWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainIndexWord").field("id", &self.id).finish()
    }
}

struct CacheState {
    safe_id: Option<SafeId>,
    words: HashMap<String, PlainIndexWord>,
    last_access: Instant,
    timer_armed: bool,
}

impl CacheState {
    fn clear(&mut self) {
        // PlainIndexWord zeroizes itself on drop
        self.words.clear();
        self.safe_id = None;
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.last_access + ttl <= Instant::now()
    }
}

/// TTL cache of decrypted index words for one safe at a time
pub struct IndexCache {
    state: Arc<Mutex<CacheState>>,
    ttl: Duration,
}

impl IndexCache {
    /// Create an empty cache with the given idle timeout
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                safe_id: None,
                words: HashMap::new(),
                last_access: Instant::now(),
                timer_armed: false,
            })),
            ttl,
        }
    }

    /// Idle timeout
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a cached word and refresh the idle timer
    pub fn get(&self, safe_id: SafeId, id: &str) -> Option<PlainIndexWord> {
        let mut state = self.state.lock();
        if state.expired(self.ttl) {
            state.clear();
            return None;
        }
        if state.safe_id != Some(safe_id) {
            return None;
        }
        let word = state.words.get(id).cloned();
        if word.is_some() {
            state.last_access = Instant::now();
        }
        word
    }

    /// Cache decrypted words of `safe_id`
    ///
    /// Words cached for another safe are dropped first.
    pub fn insert_all(&self, safe_id: SafeId, words: impl IntoIterator<Item = PlainIndexWord>) {
        let arm = {
            let mut state = self.state.lock();
            if state.safe_id != Some(safe_id) || state.expired(self.ttl) {
                state.clear();
                state.safe_id = Some(safe_id);
            }
            for word in words {
                state.words.insert(word.id.clone(), word);
            }
            state.last_access = Instant::now();
            !std::mem::replace(&mut state.timer_armed, true)
        };

        if arm {
            self.spawn_expiry();
        }
    }

    /// Keep the cache alive without reading from it
    pub fn touch(&self) {
        let mut state = self.state.lock();
        if !state.expired(self.ttl) {
            state.last_access = Instant::now();
        }
    }

    /// Number of cached words, without checking the deadline
    pub fn len(&self) -> usize {
        self.state.lock().words.len()
    }

    /// Whether the cache holds no words
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached word
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    fn spawn_expiry(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                // Without a runtime the lazy deadline check still applies
                self.state.lock().timer_armed = false;
                return;
            }
        };

        let weak: Weak<Mutex<CacheState>> = Arc::downgrade(&self.state);
        let ttl = self.ttl;
        handle.spawn(async move {
            loop {
                let deadline = match weak.upgrade() {
                    Some(state) => state.lock().last_access + ttl,
                    None => return,
                };
                tokio::time::sleep_until(deadline).await;

                let state = match weak.upgrade() {
                    Some(state) => state,
                    None => return,
                };
                let mut state = state.lock();
                if state.expired(ttl) {
                    if let Some(safe_id) = state.safe_id {
                        tracing::debug!("Index cache expired for safe {}", safe_id);
                    }
                    state.clear();
                    state.timer_armed = false;
                    return;
                }
            }
        });
    }
}

impl Drop for IndexCache {
    fn drop(&mut self) {
        self.state.lock().clear();
    }
}
