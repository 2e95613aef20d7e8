//! Shared drive: artifact storage namespaced by sweep and trial.
//!
//! Layout is `<root>/<sweep_id>/<trial_id>/`. Trials write their artifacts and
//! a `metrics.json` there; the controller itself only reclaims a sweep's
//! namespace when the sweep is deleted.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use sw_types::SwResult;
use tracing::debug;

/// File a trial writes its latest metrics to, as a flat JSON object.
pub const METRICS_FILE: &str = "metrics.json";

#[derive(Debug, Clone)]
pub struct SharedDrive {
    root: PathBuf,
}

impl SharedDrive {
    pub fn new<P: AsRef<Path>>(root: P) -> SwResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sweep_dir(&self, sweep_id: &str) -> PathBuf {
        self.root.join(sweep_id)
    }

    pub fn trial_dir(&self, sweep_id: &str, trial_id: usize) -> PathBuf {
        self.sweep_dir(sweep_id).join(trial_id.to_string())
    }

    pub async fn ensure_trial_dir(&self, sweep_id: &str, trial_id: usize) -> SwResult<PathBuf> {
        let dir = self.trial_dir(sweep_id, trial_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    fn artifact_path(&self, sweep_id: &str, trial_id: usize, name: &str) -> SwResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(sw_types::validation_error!("invalid artifact name {name:?}"));
        }
        Ok(self.trial_dir(sweep_id, trial_id).join(name))
    }

    pub async fn write_artifact(
        &self,
        sweep_id: &str,
        trial_id: usize,
        name: &str,
        contents: &[u8],
    ) -> SwResult<PathBuf> {
        let path = self.artifact_path(sweep_id, trial_id, name)?;
        self.ensure_trial_dir(sweep_id, trial_id).await?;
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// `None` if the artifact does not exist.
    pub async fn read_artifact(
        &self,
        sweep_id: &str,
        trial_id: usize,
        name: &str,
    ) -> SwResult<Option<Vec<u8>>> {
        let path = self.artifact_path(sweep_id, trial_id, name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Numeric entries of a trial's `metrics.json`; empty if it has not
    /// written one yet.
    pub async fn read_metrics(
        &self,
        sweep_id: &str,
        trial_id: usize,
    ) -> SwResult<HashMap<String, f64>> {
        let Some(bytes) = self.read_artifact(sweep_id, trial_id, METRICS_FILE).await? else {
            return Ok(HashMap::new());
        };
        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&bytes)?;
        Ok(raw
            .into_iter()
            .filter_map(|(name, value)| value.as_f64().map(|v| (name, v)))
            .collect())
    }

    /// Delete a sweep's whole namespace. Returns whether anything was removed.
    pub async fn remove_sweep(&self, sweep_id: &str) -> SwResult<bool> {
        let dir = self.sweep_dir(sweep_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(sweep_id, path = %dir.display(), "removed sweep namespace");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
