//! The set of live sessions, keyed by session key.
//!
//! At most one process exists per key. The first `get_or_create` for a key
//! inserts a `Starting` placeholder holding a shared startup future before
//! anything is awaited; concurrent callers find the placeholder and await the
//! same startup instead of spawning again. A session being shut down stays
//! in the map as `Stopping` until its process is gone, and callers for that
//! key wait for it before starting a replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::config::SessionConfig;
use crate::error::{Error, Result};

use super::Session;
use super::spawn::Spawner;

type Startup = Shared<BoxFuture<'static, Result<Arc<Session>>>>;
type Stopped = Shared<BoxFuture<'static, ()>>;

enum Entry {
    Starting { generation: u64, startup: Startup },
    Live(Arc<Session>),
    Stopping { generation: u64, done: Stopped },
}

enum Lookup {
    Start(Startup),
    Wait(Stopped),
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// Owns every live session. Construct one per application and share it by `Arc`.
pub struct SessionRegistry {
    spawner: Arc<dyn Spawner>,
    config: SessionConfig,
    entries: Entries,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(spawner: Arc<dyn Spawner>, config: SessionConfig) -> Self {
        Self {
            spawner,
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The ready session for `key`, starting one if there is none.
    ///
    /// A session that has terminated is replaced. If startup fails, every
    /// caller waiting on it gets the same [`Error::StartupFailure`] and the
    /// next call starts over.
    pub async fn get_or_create(&self, key: &str) -> Result<Arc<Session>> {
        loop {
            let lookup = {
                let mut entries = lock(&self.entries);
                match entries.get(key) {
                    Some(Entry::Live(session)) if !session.is_terminated() => {
                        return Ok(session.clone());
                    }
                    Some(Entry::Starting { startup, .. }) => Lookup::Start(startup.clone()),
                    Some(Entry::Stopping { done, .. }) => Lookup::Wait(done.clone()),
                    _ => {
                        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        let startup = self.start(key.to_string(), generation);
                        entries.insert(
                            key.to_string(),
                            Entry::Starting {
                                generation,
                                startup: startup.clone(),
                            },
                        );
                        Lookup::Start(startup)
                    }
                }
            };

            match lookup {
                Lookup::Start(startup) => return startup.await,
                Lookup::Wait(done) => {
                    tracing::debug!("Waiting for session '{}' to stop before restarting it", key);
                    done.await;
                }
            }
        }
    }

    /// The live session for `key`, without creating one.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        match lock(&self.entries).get(key) {
            Some(Entry::Live(session)) if !session.is_terminated() => Some(session.clone()),
            _ => None,
        }
    }

    /// Keys with a live or starting session.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.entries)
            .iter()
            .filter(|(_, entry)| !matches!(entry, Entry::Stopping { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| !matches!(entry, Entry::Stopping { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down the session for `key`. Returns `false` if there was none.
    ///
    /// The key stays reserved until the process has exited or been killed.
    pub async fn shutdown(&self, key: &str) -> bool {
        let stopping = self.stop_locked(&mut lock(&self.entries), key);
        match stopping {
            Some(done) => {
                done.await;
                true
            }
            None => false,
        }
    }

    /// Shut down every session, e.g. when the application exits.
    pub async fn shutdown_all(&self) {
        let stopping: Vec<Stopped> = {
            let mut entries = lock(&self.entries);
            let keys: Vec<String> = entries.keys().cloned().collect();
            keys.iter()
                .filter_map(|key| self.stop_locked(&mut entries, key))
                .collect()
        };
        if stopping.is_empty() {
            return;
        }
        tracing::info!("Shutting down {} sessions", stopping.len());
        futures::future::join_all(stopping).await;
    }

    /// Replace the entry for `key` with a `Stopping` marker and start the
    /// shutdown in its own task. The first waiter to see the shutdown finish
    /// removes the marker.
    fn stop_locked(&self, entries: &mut HashMap<String, Entry>, key: &str) -> Option<Stopped> {
        let entry = entries.remove(key)?;
        if let Entry::Stopping { generation, done } = entry {
            entries.insert(
                key.to_string(),
                Entry::Stopping {
                    generation,
                    done: done.clone(),
                },
            );
            return Some(done);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let shared_entries = self.entries.clone();
        let task_key = key.to_string();
        let task = tokio::spawn(async move { shutdown_entry(&task_key, entry).await });

        let task_key = key.to_string();
        let done: Stopped = async move {
            if let Err(e) = task.await {
                tracing::warn!("Shutdown of session '{}' failed: {}", task_key, e);
            }
            let mut entries = lock(&shared_entries);
            let current = matches!(
                entries.get(&task_key),
                Some(Entry::Stopping { generation: g, .. }) if *g == generation
            );
            if current {
                entries.remove(&task_key);
            }
        }
        .boxed()
        .shared();
        entries.insert(
            key.to_string(),
            Entry::Stopping {
                generation,
                done: done.clone(),
            },
        );
        Some(done)
    }

    /// Spawn and wait for readiness in a task so startup continues even if
    /// the first caller goes away.
    fn start(&self, key: String, generation: u64) -> Startup {
        let spawner = self.spawner.clone();
        let config = self.config.clone();
        let entries = self.entries.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let key = task_key;
            let result = match spawner.spawn(&key) {
                Ok(spawned) => {
                    let session = Arc::new(Session::launch(key.clone(), spawned, &config));
                    session.wait_ready().await.map(|()| session)
                }
                Err(e) => Err(Error::StartupFailure {
                    key: key.clone(),
                    message: e.to_string(),
                }),
            };

            let mut entries = lock(&entries);
            let current = matches!(
                entries.get(&key),
                Some(Entry::Starting { generation: g, .. }) if *g == generation
            );
            if current {
                match &result {
                    Ok(session) => {
                        entries.insert(key.clone(), Entry::Live(session.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("{}", e);
                        entries.remove(&key);
                    }
                }
            }
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(Error::StartupFailure {
                    key,
                    message: format!("startup task failed: {}", e),
                })
            })
        }
        .boxed()
        .shared()
    }
}

async fn shutdown_entry(key: &str, entry: Entry) {
    let session = match entry {
        Entry::Live(session) => session,
        Entry::Starting { startup, .. } => match startup.await {
            Ok(session) => session,
            Err(_) => return,
        },
        Entry::Stopping { done, .. } => {
            done.await;
            return;
        }
    };
    tracing::debug!("Shutting down session '{}'", key);
    session.shutdown().await;
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Entry>> {
    // Never held across an await, so a poisoned lock still has consistent data.
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::session::spawn::SpawnedProcess;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncWriteExt, duplex};

    /// Spawner whose "interpreter" only announces readiness (or not).
    /// A stubborn one ignores EXIT and never closes its output.
    struct StubSpawner {
        spawned: AtomicUsize,
        announce: bool,
        stubborn: bool,
    }

    impl Spawner for StubSpawner {
        fn spawn(&self, _key: &str) -> Result<SpawnedProcess> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let (host_in, mut interp_in) = duplex(1024);
            let (mut interp_out, host_out) = duplex(1024);
            let announce = self.announce;
            let stubborn = self.stubborn;
            tokio::spawn(async move {
                if announce {
                    let _ = interp_out.write_all(b"PYTHON_SESSION_READY\n").await;
                }
                // Hold the pipes until the host closes stdin
                let _ = tokio::io::copy(&mut interp_in, &mut tokio::io::sink()).await;
                if stubborn {
                    std::future::pending::<()>().await;
                }
                drop(interp_out);
            });
            Ok(SpawnedProcess::from_streams(host_in, host_out, None))
        }
    }

    fn registry(announce: bool) -> (Arc<StubSpawner>, SessionRegistry) {
        stub_registry(announce, false)
    }

    fn stub_registry(announce: bool, stubborn: bool) -> (Arc<StubSpawner>, SessionRegistry) {
        let spawner = Arc::new(StubSpawner {
            spawned: AtomicUsize::new(0),
            announce,
            stubborn,
        });
        let config = SessionConfig {
            ready_timeout_ms: 200,
            shutdown_grace_ms: 100,
            ..SessionConfig::default()
        };
        (spawner.clone(), SessionRegistry::new(spawner, config))
    }

    #[tokio::test]
    async fn test_reuses_live_session() {
        let (spawner, registry) = registry(true);
        let first = registry.get_or_create("a").await.unwrap();
        let second = registry.get_or_create("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(registry.keys(), vec!["a"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
    }

    #[tokio::test]
    async fn test_separate_keys_get_separate_sessions() {
        let (spawner, registry) = registry(true);
        let a = registry.get_or_create("a").await.unwrap();
        let b = registry.get_or_create("b").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_removes_entry() {
        let (spawner, registry) = registry(true);
        let session = registry.get_or_create("a").await.unwrap();
        assert!(registry.shutdown("a").await);
        assert!(!registry.shutdown("a").await);
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(registry.is_empty());

        // A new request starts a new process
        let replacement = registry.get_or_create("a").await.unwrap();
        assert!(!Arc::ptr_eq(&session, &replacement));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_failure_is_shared_and_retried() {
        let (spawner, registry) = registry(false);
        let (a, b) = tokio::join!(registry.get_or_create("a"), registry.get_or_create("a"));
        assert!(matches!(a, Err(Error::StartupFailure { .. })));
        assert!(matches!(b, Err(Error::StartupFailure { .. })));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        assert!(registry.get_or_create("a").await.is_err());
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let (_spawner, registry) = registry(true);
        let a = registry.get_or_create("a").await.unwrap();
        let b = registry.get_or_create("b").await.unwrap();
        registry.shutdown_all().await;
        assert!(registry.is_empty());
        assert!(a.is_terminated());
        assert!(b.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_kills_after_grace() {
        let (_spawner, registry) = stub_registry(true, true);
        let session = registry.get_or_create("a").await.unwrap();

        let started = tokio::time::Instant::now();
        let (pending, stopped) = tokio::join!(session.submit("while True: pass"), registry.shutdown("a"));
        assert!(stopped);
        assert!(matches!(pending, Err(Error::SessionShuttingDown)));
        assert!(started.elapsed() >= registry.config().shutdown_grace());
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_restart_waits_for_stopping_session() {
        let (spawner, registry) = stub_registry(true, true);
        let registry = Arc::new(registry);
        let old = registry.get_or_create("a").await.unwrap();

        let stopping = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.shutdown("a").await })
        };
        while !old.is_terminated() {
            tokio::task::yield_now().await;
        }
        assert_eq!(old.state(), SessionState::Terminating);
        assert!(registry.get("a").is_none());

        // The old process is still inside its grace period here
        let replacement = registry.get_or_create("a").await.unwrap();
        assert_eq!(old.state(), SessionState::Terminated);
        assert!(!Arc::ptr_eq(&old, &replacement));
        assert!(stopping.await.unwrap());
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(registry.keys(), vec!["a"]);
    }
}
