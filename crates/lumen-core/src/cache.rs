//! Short-lived cache of execution results.
//!
//! A result is inserted as soon as it arrives and taken by its caller. Until
//! it is taken, the files its artifacts point to are protected from the
//! sweeper; after that it lingers for late lookups until its TTL runs out.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::model::ExecutionResult;

#[derive(Debug)]
struct CachedResult {
    result: ExecutionResult,
    inserted: Instant,
    consumed: bool,
}

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, CachedResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, result: ExecutionResult) {
        self.insert_at(result, Instant::now());
    }

    /// Insert with an explicit timestamp.
    pub fn insert_at(&self, result: ExecutionResult, inserted: Instant) {
        self.lock().insert(
            result.execution_id.clone(),
            CachedResult {
                result,
                inserted,
                consumed: false,
            },
        );
    }

    /// Hand the result to its caller, marking it consumed.
    pub fn take(&self, execution_id: &str) -> Option<ExecutionResult> {
        let mut entries = self.lock();
        let entry = entries.get_mut(execution_id)?;
        entry.consumed = true;
        Some(entry.result.clone())
    }

    /// Look a result up without consuming it.
    pub fn get(&self, execution_id: &str) -> Option<ExecutionResult> {
        self.lock().get(execution_id).map(|e| e.result.clone())
    }

    pub fn is_consumed(&self, execution_id: &str) -> Option<bool> {
        self.lock().get(execution_id).map(|e| e.consumed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evict_expired(&self, ttl: Duration) -> usize {
        self.evict_at(Instant::now(), ttl)
    }

    /// Drop results older than `ttl` as of `now`.
    ///
    /// Unconsumed results are evicted too: nobody is left to take them.
    pub fn evict_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|id, entry| {
            let keep = now.saturating_duration_since(entry.inserted) <= ttl;
            if !keep && !entry.consumed {
                tracing::debug!("Evicting unconsumed result {}", id);
            }
            keep
        });
        before - entries.len()
    }

    /// Artifact files referenced by results nobody has taken yet.
    pub fn referenced_artifacts(&self) -> HashSet<PathBuf> {
        self.lock()
            .values()
            .filter(|e| !e.consumed)
            .flat_map(|e| e.result.artifact_paths())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedResult>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
