//! Keyed schema lock
//!
//! Structural changes to one collection are serialized on a
//! `(project, collection)` key. Reads never take it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::backend::{Executor, RowExt};
use crate::config::LockMode;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub project_id: String,
    pub collection_id: String,
}

impl LockKey {
    pub fn new(project_id: &str, collection_id: &str) -> Self {
        LockKey {
            project_id: project_id.to_string(),
            collection_id: collection_id.to_string(),
        }
    }

    /// Stable 64-bit key for backend advisory locks
    pub fn advisory_id(&self) -> i64 {
        let digest = Sha256::digest(format!("{}:{}", self.project_id, self.collection_id));
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(buf)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.collection_id)
    }
}

pub trait SchemaLock: Send + Sync {
    /// Take the lock for `key`. `Ok(false)` means someone else holds it.
    fn try_acquire(&self, exec: &dyn Executor, key: &LockKey) -> EngineResult<bool>;

    fn release(&self, exec: &dyn Executor, key: &LockKey) -> EngineResult<()>;
}

/// Process-local keyed mutex
pub struct InProcessLock {
    held: Mutex<HashSet<LockKey>>,
    freed: Condvar,
    wait: Duration,
}

impl InProcessLock {
    /// `wait` of zero fails immediately on contention.
    pub fn new(wait: Duration) -> Self {
        InProcessLock {
            held: Mutex::new(HashSet::new()),
            freed: Condvar::new(),
            wait,
        }
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held.lock().contains(key)
    }
}

impl Default for InProcessLock {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl SchemaLock for InProcessLock {
    fn try_acquire(&self, _exec: &dyn Executor, key: &LockKey) -> EngineResult<bool> {
        let deadline = Instant::now() + self.wait;
        let mut held = self.held.lock();
        loop {
            if !held.contains(key) {
                held.insert(key.clone());
                return Ok(true);
            }
            if self.wait.is_zero() {
                return Ok(false);
            }
            if self.freed.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                return Ok(false);
            }
        }
    }

    fn release(&self, _exec: &dyn Executor, key: &LockKey) -> EngineResult<()> {
        self.held.lock().remove(key);
        self.freed.notify_all();
        Ok(())
    }
}

/// Transaction-scoped backend advisory lock; released at commit/rollback.
pub struct AdvisoryLock;

impl SchemaLock for AdvisoryLock {
    fn try_acquire(&self, exec: &dyn Executor, key: &LockKey) -> EngineResult<bool> {
        let probe = exec.dialect().advisory_lock_probe().ok_or_else(|| {
            EngineError::validation(format!(
                "advisory schema locks are not available on the {} dialect",
                exec.dialect()
            ))
        })?;
        let row = exec.query_one(&probe, &[json!(key.advisory_id())])?;
        Ok(row.is_some_and(|r| r.flag("locked")))
    }

    fn release(&self, _exec: &dyn Executor, _key: &LockKey) -> EngineResult<()> {
        Ok(())
    }
}

/// For single-writer backends
pub struct NoopLock;

impl SchemaLock for NoopLock {
    fn try_acquire(&self, _exec: &dyn Executor, _key: &LockKey) -> EngineResult<bool> {
        Ok(true)
    }

    fn release(&self, _exec: &dyn Executor, _key: &LockKey) -> EngineResult<()> {
        Ok(())
    }
}

pub fn lock_for_mode(mode: LockMode, wait: Duration) -> Arc<dyn SchemaLock> {
    match mode {
        LockMode::InProcess => Arc::new(InProcessLock::new(wait)),
        LockMode::Advisory => Arc::new(AdvisoryLock),
        LockMode::Noop => Arc::new(NoopLock),
    }
}

/// Held schema lock; released when dropped, on every exit path.
pub struct LockGuard<'a> {
    lock: &'a dyn SchemaLock,
    exec: &'a dyn Executor,
    key: LockKey,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

pub fn acquire<'a>(
    lock: &'a dyn SchemaLock,
    exec: &'a dyn Executor,
    key: LockKey,
) -> EngineResult<LockGuard<'a>> {
    if !lock.try_acquire(exec, &key)? {
        return Err(EngineError::LockContention(format!(
            "another schema change is in progress for collection {}",
            key.collection_id
        )));
    }
    debug!(key = %key, "schema_lock_acquired");
    Ok(LockGuard { lock, exec, key })
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.exec, &self.key) {
            warn!(key = %self.key, error = %e, "schema_lock_release_failed");
        } else {
            debug!(key = %self.key, "schema_lock_released");
        }
    }
}
