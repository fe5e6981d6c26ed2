//! Sweep command implementation for Lumen CLI.

use std::sync::Arc;

use lumen_core::{ArtifactStore, LumenConfig, ResultCache, Sweeper};

/// Run one cleanup pass over the artifact directory.
///
/// A fresh process holds no cached results, so every file past its TTL goes.
pub fn execute(config: &LumenConfig) -> anyhow::Result<()> {
    let store = Arc::new(ArtifactStore::new(config.artifact_dir())?);
    let sweeper = Sweeper::new(Arc::new(ResultCache::new()), store.clone(), config.cleanup.clone());
    let report = sweeper.sweep_once()?;

    println!(
        "Deleted {} artifact files from {}",
        report.files_deleted,
        store.root().display()
    );
    Ok(())
}
