//! Filesystem-backed baseline store
//!
//! Deterministic layout under a workspace root:
//! `.vizzly/baselines/<key>.png`, `.vizzly/current/<key>.png`,
//! `.vizzly/diffs/<key>.png`. Saves are atomic (temp file in the same
//! directory, fsync, rename) so a cancelled write leaves the old value.
//! The store is safe for concurrent readers; writers to the same key are
//! serialized by the orchestrator.

use crate::VizzlyError;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Which of the three artifact slots a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Baseline,
    Current,
    Diff,
}

impl ArtifactKind {
    fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Baseline => "baselines",
            ArtifactKind::Current => "current",
            ArtifactKind::Diff => "diffs",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaselineStore {
    root: PathBuf,
}

impl BaselineStore {
    /// Creates a store rooted at `workspace` (the directory that owns the
    /// `.vizzly` tree). No filesystem work happens until `initialize`.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.root
    }

    pub fn vizzly_dir(&self) -> PathBuf {
        self.root.join(".vizzly")
    }

    /// Creates the three artifact directories.
    pub async fn initialize(&self) -> Result<(), VizzlyError> {
        for kind in [
            ArtifactKind::Baseline,
            ArtifactKind::Current,
            ArtifactKind::Diff,
        ] {
            tokio::fs::create_dir_all(self.kind_dir(kind)).await?;
        }
        Ok(())
    }

    /// Removes all stored artifacts and recreates the empty layout.
    pub async fn clear(&self) -> Result<(), VizzlyError> {
        for kind in [
            ArtifactKind::Baseline,
            ArtifactKind::Current,
            ArtifactKind::Diff,
        ] {
            let dir = self.kind_dir(kind);
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
            }
        }
        self.initialize().await
    }

    fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.vizzly_dir().join(kind.dir_name())
    }

    /// Resolves the artifact path for `key`, rejecting anything that would
    /// land outside the workspace.
    pub fn artifact_path(&self, kind: ArtifactKind, key: &str) -> Result<PathBuf, VizzlyError> {
        if key.is_empty() {
            return Err(VizzlyError::validation("key", "must not be empty"));
        }
        let file_name = format!("{}.png", key);
        let candidate = Path::new(&file_name);
        // The key is pre-encoded to be file-safe; verify anyway.
        let escapes = candidate.is_absolute()
            || candidate
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(VizzlyError::Security(format!(
                "artifact key {:?} resolves outside the workspace",
                key
            )));
        }
        Ok(self.kind_dir(kind).join(file_name))
    }

    pub async fn exists(&self, kind: ArtifactKind, key: &str) -> Result<bool, VizzlyError> {
        Ok(self.artifact_path(kind, key)?.exists())
    }

    pub async fn read(&self, kind: ArtifactKind, key: &str) -> Result<Vec<u8>, VizzlyError> {
        let path = self.artifact_path(kind, key)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Atomic save: write to a temp file in the destination directory,
    /// fsync, then rename over the target.
    pub async fn save(
        &self,
        kind: ArtifactKind,
        key: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, VizzlyError> {
        let path = self.artifact_path(kind, key)?;
        let dir = path
            .parent()
            .ok_or_else(|| VizzlyError::Io("artifact path has no parent".to_string()))?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved {:?} artifact for {}", kind, key);
        Ok(path)
    }

    pub async fn remove(&self, kind: ArtifactKind, key: &str) -> Result<(), VizzlyError> {
        let path = self.artifact_path(kind, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies the current artifact over the baseline slot.
    pub async fn promote(&self, key: &str) -> Result<(), VizzlyError> {
        let bytes = self.read(ArtifactKind::Current, key).await?;
        self.save(ArtifactKind::Baseline, key, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, BaselineStore) {
        let dir = TempDir::new().unwrap();
        let store = BaselineStore::new(dir.path());
        store.initialize().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_initialize_creates_layout() {
        let (dir, _store) = store().await;
        for sub in ["baselines", "current", "diffs"] {
            assert!(dir.path().join(".vizzly").join(sub).is_dir());
        }
    }

    #[tokio::test]
    async fn test_save_read_roundtrip() {
        let (_dir, store) = store().await;
        store
            .save(ArtifactKind::Baseline, "home", b"png-bytes")
            .await
            .unwrap();
        assert!(store.exists(ArtifactKind::Baseline, "home").await.unwrap());
        assert_eq!(
            store.read(ArtifactKind::Baseline, "home").await.unwrap(),
            b"png-bytes"
        );
        // no stray temp files left behind
        let entries: Vec<_> = std::fs::read_dir(store.vizzly_dir().join("baselines"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["home.png".to_string()]);
    }

    #[tokio::test]
    async fn test_save_overwrites_atomically() {
        let (_dir, store) = store().await;
        store
            .save(ArtifactKind::Current, "home", b"first")
            .await
            .unwrap();
        store
            .save(ArtifactKind::Current, "home", b"second")
            .await
            .unwrap();
        assert_eq!(
            store.read(ArtifactKind::Current, "home").await.unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_promote_copies_current_to_baseline() {
        let (_dir, store) = store().await;
        store
            .save(ArtifactKind::Current, "home", b"new-look")
            .await
            .unwrap();
        store.promote("home").await.unwrap();
        assert_eq!(
            store.read(ArtifactKind::Baseline, "home").await.unwrap(),
            b"new-look"
        );
    }

    #[tokio::test]
    async fn test_clear_resets_layout() {
        let (_dir, store) = store().await;
        store
            .save(ArtifactKind::Baseline, "home", b"x")
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert!(!store.exists(ArtifactKind::Baseline, "home").await.unwrap());
        assert!(store.vizzly_dir().join("baselines").is_dir());
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (_dir, store) = store().await;
        for key in ["../evil", "a/b", "a\\b", "/abs", ".."] {
            let err = store.artifact_path(ArtifactKind::Baseline, key);
            assert!(
                matches!(err, Err(VizzlyError::Security(_))),
                "key {:?} should be rejected",
                key
            );
        }
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let (_dir, store) = store().await;
        store.remove(ArtifactKind::Diff, "ghost").await.unwrap();
    }
}
