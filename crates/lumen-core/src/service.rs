//! The execution API used by the canvas.
//!
//! Ties the session registry, result cache and artifact store together:
//! `{code, source_id, session_key}` in, `{stdout, stderr, artifacts, success,
//! execution_time_ms}` out.

use std::sync::Arc;
use std::time::Instant;

use crate::artifacts::ArtifactStore;
use crate::cache::ResultCache;
use crate::config::LumenConfig;
use crate::error::{Error, Result};
use crate::model::{Artifact, ExecuteRequest, ExecuteResponse, ExecutionResult};
use crate::session::{CommandSpawner, SessionRegistry, Spawner};
use crate::sweeper::Sweeper;

pub struct ExecutionService {
    registry: Arc<SessionRegistry>,
    cache: Arc<ResultCache>,
    store: Arc<ArtifactStore>,
}

impl ExecutionService {
    pub fn new(registry: Arc<SessionRegistry>, cache: Arc<ResultCache>, store: Arc<ArtifactStore>) -> Self {
        Self {
            registry,
            cache,
            store,
        }
    }

    /// Build the whole stack from configuration, spawning the configured interpreter.
    pub fn from_config(config: &LumenConfig) -> Result<Self> {
        let spawner = CommandSpawner::from_config(config)?;
        Self::with_spawner(config, Arc::new(spawner))
    }

    /// Build from configuration with a custom spawner.
    pub fn with_spawner(config: &LumenConfig, spawner: Arc<dyn Spawner>) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(spawner, config.session.clone()));
        let store = Arc::new(ArtifactStore::new(config.artifact_dir())?);
        Ok(Self::new(registry, Arc::new(ResultCache::new()), store))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// A sweeper over this service's cache and artifact store.
    pub fn sweeper(&self, config: &LumenConfig) -> Sweeper {
        Sweeper::new(self.cache.clone(), self.store.clone(), config.cleanup.clone())
    }

    /// Run code in the session for `request.session_key`.
    ///
    /// Interpreter-side errors come back as `success == false` with an
    /// `error` artifact; only transport problems are returned as `Err`.
    ///
    /// The result is cached unconsumed before it is handed back. If the caller
    /// goes away first, the execution still finishes and its result, with the
    /// artifact files it points at, stays available to [`claim`](Self::claim)
    /// until the result TTL passes.
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let started = Instant::now();
        let session = self.registry.get_or_create(&request.session_key).await?;

        let cache = self.cache.clone();
        let store = self.store.clone();
        let code = request.code.clone();
        let delivery = tokio::spawn(async move {
            let mut result = session.submit(code).await?;
            if let Err(e) = store.materialize(&mut result) {
                tracing::warn!("{}", e);
                result.artifacts.retain(|a| !a.is_inline());
                result.artifacts.push(Artifact::error(e.to_string()));
            }
            let execution_id = result.execution_id.clone();
            cache.insert(result);
            Ok::<_, Error>(execution_id)
        });

        let execution_id = delivery
            .await
            .map_err(|e| Error::SessionTerminated(format!("execution task failed: {}", e)))??;
        let result = self.cache.take(&execution_id).ok_or_else(|| {
            Error::Protocol(format!("result {} was evicted before delivery", execution_id))
        })?;

        let success = result.success();
        let elapsed = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Executed {} for source '{}' in session '{}' ({}ms, success: {})",
            execution_id,
            request.source_id,
            request.session_key,
            elapsed,
            success
        );

        Ok(ExecuteResponse {
            execution_id: Some(execution_id),
            source_id: request.source_id.clone(),
            stdout: result.stdout,
            stderr: result.stderr,
            artifacts: result.artifacts,
            success,
            execution_time_ms: elapsed,
        })
    }

    /// Like [`execute`](Self::execute), but failures become an error artifact
    /// so there is always something to display.
    pub async fn execute_or_render(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let started = Instant::now();
        match self.execute(request).await {
            Ok(response) => response,
            Err(e) => render_failure(request, &e, started.elapsed().as_millis() as u64),
        }
    }

    /// Take a cached result whose caller never received it.
    pub fn claim(&self, execution_id: &str) -> Option<ExecutionResult> {
        self.cache.take(execution_id)
    }

    /// Shut down every session.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

/// Turn a transport failure into a displayable response.
pub fn render_failure(request: &ExecuteRequest, error: &Error, execution_time_ms: u64) -> ExecuteResponse {
    tracing::warn!(
        "Execution for source '{}' in session '{}' failed: {}",
        request.source_id,
        request.session_key,
        error
    );
    let mut artifact = Artifact::error(error.to_string());
    artifact
        .metadata
        .insert("transport".into(), serde_json::Value::Bool(error.is_transport()));

    ExecuteResponse {
        execution_id: None,
        source_id: request.source_id.clone(),
        stdout: String::new(),
        stderr: String::new(),
        artifacts: vec![artifact],
        success: false,
        execution_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArtifactKind;

    #[test]
    fn test_render_failure() {
        let request = ExecuteRequest {
            code: "x".into(),
            source_id: "cell-1".into(),
            session_key: "doc".into(),
        };
        let response = render_failure(&request, &Error::SessionShuttingDown, 7);
        assert!(!response.success);
        assert_eq!(response.source_id, "cell-1");
        assert_eq!(response.execution_time_ms, 7);
        assert!(response.execution_id.is_none());
        assert_eq!(response.artifacts.len(), 1);
        assert_eq!(response.artifacts[0].kind, ArtifactKind::Error);
        assert_eq!(response.artifacts[0].payload, "session is shutting down");
        assert_eq!(response.artifacts[0].metadata["transport"], true);
    }
}
