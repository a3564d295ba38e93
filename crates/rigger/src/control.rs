//! The control-plane capability consumed by the executor.
//!
//! The HTTP transport lives outside the core; the executor only needs a
//! narrow seam for commit metadata and artifact upload.

use std::sync::{Arc, Mutex};

use anyhow::Result;

/// Operations the core performs against the control plane.
pub trait ControlPlane: Send {
    fn meta_data_exists(&self, key: &str) -> Result<bool>;
    fn meta_data_set(&self, key: &str, value: &str) -> Result<()>;
    fn upload_artifacts(&self, paths: &str, destination: &str) -> Result<()>;
}

/// Control plane that accepts and discards everything; used for local
/// runs without an API connection.
#[derive(Debug, Default)]
pub struct NoopControlPlane;

impl ControlPlane for NoopControlPlane {
    fn meta_data_exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    fn meta_data_set(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn upload_artifacts(&self, _paths: &str, _destination: &str) -> Result<()> {
        Ok(())
    }
}

/// Recording fake for tests: remembers every call.
#[derive(Clone, Default)]
pub struct RecordingControlPlane {
    pub meta_data: Arc<Mutex<Vec<(String, String)>>>,
    pub uploads: Arc<Mutex<Vec<(String, String)>>>,
}

impl ControlPlane for RecordingControlPlane {
    fn meta_data_exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .meta_data
            .lock()
            .expect("poisoned")
            .iter()
            .any(|(k, _)| k == key))
    }

    fn meta_data_set(&self, key: &str, value: &str) -> Result<()> {
        self.meta_data
            .lock()
            .expect("poisoned")
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn upload_artifacts(&self, paths: &str, destination: &str) -> Result<()> {
        self.uploads
            .lock()
            .expect("poisoned")
            .push((paths.to_string(), destination.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_fake_tracks_meta_data() {
        let cp = RecordingControlPlane::default();
        assert!(!cp.meta_data_exists("buildkite:git:commit").expect("exists"));
        cp.meta_data_set("buildkite:git:commit", "deadbeef").expect("set");
        assert!(cp.meta_data_exists("buildkite:git:commit").expect("exists"));
    }

    #[test]
    fn noop_reports_nothing_present() {
        let cp = NoopControlPlane;
        assert!(!cp.meta_data_exists("anything").expect("exists"));
        cp.upload_artifacts("**/*.xml", "").expect("upload");
    }
}
