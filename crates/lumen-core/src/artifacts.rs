//! Artifact file storage.
//!
//! One directory is shared by every session. Files get uuid names, so
//! concurrent writers never collide and no locking is needed; a file is
//! written under a temporary name and renamed, so readers only ever see
//! complete files.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};
use crate::model::{ArtifactKind, ExecutionResult};

const TEMP_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) the store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            Error::Io(format!("failed to create artifact dir {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` to a new uniquely named file and return its path.
    pub fn write(&self, bytes: &[u8], extension: &str) -> Result<PathBuf> {
        let name = format!("{}.{}", uuid::Uuid::new_v4().simple(), extension);
        let path = self.root.join(&name);
        let temp = self.root.join(format!("{}{}", name, TEMP_SUFFIX));

        fs::write(&temp, bytes)?;
        fs::rename(&temp, &path)?;
        Ok(path)
    }

    /// Move inline (base64) image payloads into files.
    ///
    /// The payload becomes the file path and the `encoding` marker is dropped.
    /// Returns the number of artifacts written.
    pub fn materialize(&self, result: &mut ExecutionResult) -> Result<usize> {
        let mut written = 0;
        for artifact in result
            .artifacts
            .iter_mut()
            .filter(|a| a.kind == ArtifactKind::Image && a.is_inline())
        {
            let bytes = BASE64.decode(artifact.payload.trim()).map_err(|e| {
                Error::Protocol(format!(
                    "invalid base64 image in execution {}: {}",
                    result.execution_id, e
                ))
            })?;
            let extension = artifact
                .metadata
                .get("format")
                .and_then(|v| v.as_str())
                .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .unwrap_or("png")
                .to_string();

            let path = self.write(&bytes, &extension)?;
            artifact.metadata.remove("encoding");
            artifact.payload = path.to_string_lossy().to_string();
            written += 1;
        }
        Ok(written)
    }

    /// Delete files older than `ttl` unless listed in `keep`.
    pub fn sweep(&self, ttl: Duration, keep: &HashSet<PathBuf>) -> Result<usize> {
        self.sweep_at(SystemTime::now(), ttl, keep)
    }

    pub fn sweep_at(&self, now: SystemTime, ttl: Duration, keep: &HashSet<PathBuf>) -> Result<usize> {
        let mut deleted = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            if keep.contains(&path) {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= ttl {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                // Another sweeper got there first
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to delete artifact {}: {}", path.display(), e),
            }
        }
        if deleted > 0 {
            tracing::debug!("Deleted {} expired artifact files", deleted);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Artifact;

    #[test]
    fn test_write_unique_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts")).unwrap();
        let a = store.write(b"one", "png").unwrap();
        let b = store.write(b"two", "png").unwrap();
        assert_ne!(a, b);
        assert_eq!(fs::read(&a).unwrap(), b"one");
        assert_eq!(a.extension().unwrap(), "png");
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 2);
    }

    #[test]
    fn test_materialize_inline_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();

        let mut inline = Artifact::image(BASE64.encode(b"\x89PNG fake"));
        inline.metadata.insert("encoding".into(), "base64".into());
        inline.metadata.insert("format".into(), "svg".into());
        let mut result = ExecutionResult {
            execution_id: "e1".into(),
            stdout: String::new(),
            stderr: String::new(),
            artifacts: vec![Artifact::text("t"), inline, Artifact::image("/already/a/file.png")],
        };

        assert_eq!(store.materialize(&mut result).unwrap(), 1);
        let path = result.artifacts[1].file_path().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"\x89PNG fake");
        assert_eq!(path.extension().unwrap(), "svg");
        assert!(!result.artifacts[1].is_inline());
        assert_eq!(result.artifacts[2].payload, "/already/a/file.png");
    }

    #[test]
    fn test_materialize_rejects_bad_base64() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let mut bad = Artifact::image("!!not base64!!");
        bad.metadata.insert("encoding".into(), "base64".into());
        let mut result = ExecutionResult {
            execution_id: "e1".into(),
            stdout: String::new(),
            stderr: String::new(),
            artifacts: vec![bad],
        };
        assert!(matches!(store.materialize(&mut result), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_sweep_respects_ttl_and_keep() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let kept = store.write(b"k", "png").unwrap();
        let dropped = store.write(b"d", "png").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let keep: HashSet<PathBuf> = [kept.clone()].into_iter().collect();
        let ttl = Duration::from_secs(60);

        // Nothing is old yet
        assert_eq!(store.sweep(ttl, &keep).unwrap(), 0);

        let later = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(store.sweep_at(later, ttl, &keep).unwrap(), 1);
        assert!(kept.exists());
        assert!(!dropped.exists());
        assert!(dir.path().join("subdir").exists());
    }
}
