//! Per-safe reader/writer locks.
//!
//! Data operations hold the shared side for their whole duration; password
//! change, destruction and biometric toggles hold the exclusive side, so a
//! rotation never observes a half-finished write and vice versa.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::SafeId;

/// Registry of one async `RwLock` per safe
#[derive(Default)]
pub struct SafeLocks {
    locks: Mutex<HashMap<SafeId, Arc<RwLock<()>>>>,
}

impl SafeLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, safe_id: SafeId) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(safe_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Wait for the shared side of `safe_id`
    pub async fn read(&self, safe_id: SafeId) -> OwnedRwLockReadGuard<()> {
        self.lock_for(safe_id).read_owned().await
    }

    /// Wait for the exclusive side of `safe_id`
    pub async fn write(&self, safe_id: SafeId) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(safe_id).write_owned().await
    }

    /// Drop the entry of a deleted safe
    pub fn forget(&self, safe_id: SafeId) {
        self.locks.lock().remove(&safe_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_readers_share() {
        let locks = SafeLocks::new();
        let id = SafeId::new();
        let _a = locks.read(id).await;
        let _b = locks.read(id).await;
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let locks = Arc::new(SafeLocks::new());
        let id = SafeId::new();
        let writer = locks.write(id).await;

        let pending = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.read(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        drop(writer);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_safes_do_not_contend() {
        let locks = SafeLocks::new();
        let _a = locks.write(SafeId::new()).await;
        let _b = locks.write(SafeId::new()).await;
    }
}
