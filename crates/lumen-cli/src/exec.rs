//! Exec command implementation for Lumen CLI.
//!
//! Runs each file as one source in a shared session, reconciles the outputs
//! against the slots of the previous run, and prints one JSON line per source.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use lumen_core::reconcile::{Position, Size};
use lumen_core::{
    Anchor, BindingStore, ExecuteRequest, ExecuteResponse, ExecutionService, LumenConfig, Reconciler,
};

pub struct ExecOptions {
    pub session: String,
    pub layout: Option<PathBuf>,
    pub anchor: Anchor,
    pub parallel: bool,
}

/// Parse `x,y,width,height`.
pub fn parse_anchor(value: &str) -> Result<Anchor, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid anchor '{}': {}", value, e))?;

    match parts.as_slice() {
        &[x, y, width, height] if width >= 0.0 && height >= 0.0 => Ok(Anchor {
            position: Position { x, y },
            size: Size { width, height },
        }),
        _ => Err(format!(
            "invalid anchor '{}': expected x,y,width,height with non-negative size",
            value
        )),
    }
}

/// Source ID for a file: its stem, or the whole path when it has none.
fn source_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Execute files.
pub async fn execute(config: &LumenConfig, files: &[PathBuf], options: &ExecOptions) -> anyhow::Result<()> {
    let start = Instant::now();

    let mut requests = Vec::with_capacity(files.len());
    for path in files {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        requests.push(ExecuteRequest {
            code,
            source_id: source_id(path),
            session_key: options.session.clone(),
        });
    }

    let service = ExecutionService::from_config(config)?;
    let sweeper = service.sweeper(config).spawn();

    let run = async {
        if options.parallel {
            futures::future::join_all(requests.iter().map(|r| service.execute_or_render(r))).await
        } else {
            let mut responses = Vec::with_capacity(requests.len());
            for request in &requests {
                responses.push(service.execute_or_render(request).await);
            }
            responses
        }
    };

    let responses = tokio::select! {
        responses = run => Some(responses),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping sessions");
            None
        }
    };

    sweeper.stop().await;
    service.shutdown().await;

    let Some(responses) = responses else {
        anyhow::bail!("interrupted before all executions finished");
    };

    let failures = place_outputs(config, options, &responses)?;

    tracing::info!(
        "Executed {} sources in {:.2}s",
        responses.len(),
        start.elapsed().as_secs_f64()
    );

    if failures > 0 {
        anyhow::bail!("{} of {} executions failed", failures, responses.len());
    }
    Ok(())
}

/// Reconcile each response against the stored layout and print it.
/// Returns the number of failed executions.
fn place_outputs(config: &LumenConfig, options: &ExecOptions, responses: &[ExecuteResponse]) -> anyhow::Result<usize> {
    let reconciler = Reconciler::new(config.layout.clone());
    let mut bindings = match &options.layout {
        Some(path) => BindingStore::load(path)?,
        None => BindingStore::new(),
    };

    let mut failures = 0;
    for response in responses {
        if !response.success {
            failures += 1;
        }
        let prior = bindings.prior_slots(&response.source_id);
        let reconciliation = reconciler.reconcile(&options.anchor, &prior, &response.artifacts);
        let slots = bindings.apply(&response.source_id, &reconciliation);

        let line = serde_json::json!({
            "response": response,
            "slots": slots,
            "removed": reconciliation.removed,
            "reused": reconciliation.reused_count(),
        });
        println!("{}", serde_json::to_string(&line)?);
    }

    if let Some(path) = &options.layout {
        bindings.save(path)?;
    }
    Ok(failures)
}
