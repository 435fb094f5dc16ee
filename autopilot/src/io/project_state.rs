//! Per-project documents under `<project>/.autopilot/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::features::Feature;
use crate::core::harness_state::HarnessContext;
use crate::io::atomic::write_json;

pub const STATE_DIR: &str = ".autopilot";

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub features_path: PathBuf,
    pub harness_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        let state_dir = root.join(STATE_DIR);
        Self {
            root: root.to_path_buf(),
            features_path: state_dir.join("features.json"),
            harness_path: state_dir.join("harness.json"),
            state_dir,
        }
    }
}

/// On-disk shape of `features.json`; order is scheduling tie-break order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureDocument {
    pub features: Vec<Feature>,
}

pub fn load_features(path: &Path) -> Result<Option<Vec<Feature>>> {
    let doc: Option<FeatureDocument> = load_optional(path)?;
    Ok(doc.map(|doc| doc.features))
}

pub fn write_features(path: &Path, features: &[Feature]) -> Result<()> {
    debug!(path = %path.display(), count = features.len(), "writing features");
    write_json(
        path,
        &FeatureDocument {
            features: features.to_vec(),
        },
    )
}

pub fn load_harness_context(path: &Path) -> Result<Option<HarnessContext>> {
    load_optional(path)
}

pub fn write_harness_context(path: &Path, context: &HarnessContext) -> Result<()> {
    debug!(
        path = %path.display(),
        state = %context.state,
        transitions = context.history.len(),
        "writing harness context"
    );
    write_json(path, context)
}

fn load_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::harness_state::HarnessState;
    use crate::test_support::feature;

    #[test]
    fn missing_documents_load_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        assert!(load_features(&paths.features_path).expect("load").is_none());
        assert!(load_harness_context(&paths.harness_path).expect("load").is_none());
    }

    /// Feature order survives a round trip since it breaks priority ties.
    #[test]
    fn features_keep_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        let features = vec![feature("B", 1, &[]), feature("A", 1, &["B"])];
        write_features(&paths.features_path, &features).expect("write");
        assert_eq!(
            load_features(&paths.features_path).expect("load"),
            Some(features)
        );
    }

    #[test]
    fn harness_context_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        let mut context = HarnessContext::new(temp.path().display().to_string(), "s-1");
        context.transition(HarnessState::Init, None).expect("transition");
        write_harness_context(&paths.harness_path, &context).expect("write");
        let loaded = load_harness_context(&paths.harness_path)
            .expect("load")
            .expect("context");
        assert_eq!(loaded.state, HarnessState::Init);
        assert_eq!(loaded.history.len(), 1);
    }
}
