//! File renderer: objects come from a manifest directory, the plan from a
//! separate rollout file. The trigger payload is ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use capstan_core::plan::Rollout;

use crate::{RenderResult, Renderer};

pub struct FileRenderer {
    directory: PathBuf,
    rollout_file: PathBuf,
}

impl FileRenderer {
    pub fn new(directory: impl Into<PathBuf>, rollout_file: impl Into<PathBuf>) -> Self {
        FileRenderer {
            directory: directory.into(),
            rollout_file: rollout_file.into(),
        }
    }

    fn read_objects(&self) -> Result<BTreeMap<String, Value>> {
        let mut objects = BTreeMap::new();
        collect_files(&self.directory, &self.directory, &mut objects)?;
        debug!(count = objects.len(), dir = %self.directory.display(), "read manifest objects");
        Ok(objects)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, Value>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let obj: Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        let key = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        out.insert(key, obj);
    }
    Ok(())
}

#[async_trait]
impl Renderer for FileRenderer {
    async fn render(&self, _raw_config: Option<&[u8]>) -> Result<RenderResult> {
        let objects = self.read_objects()?;
        let raw = fs::read_to_string(&self.rollout_file)
            .with_context(|| format!("reading rollout file {}", self.rollout_file.display()))?;
        let rollout: Rollout = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing rollout file {}", self.rollout_file.display()))?;
        Ok(RenderResult { objects, rollout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_directory_and_plan() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = dir.path().join("manifests");
        fs::create_dir_all(manifests.join("apps")).unwrap();
        fs::write(
            manifests.join("configmap.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n",
        )
        .unwrap();
        fs::write(
            manifests.join("apps/deployment.json"),
            r#"{"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web"}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("rollout.yaml"),
            r#"
apiVersion: capstan.io/v1
kind: Rollout
metadata:
  name: test
spec:
  groups:
  - name: all
    steps:
    - object: configmap.yaml
      action: CreateOrUpdate
"#,
        )
        .unwrap();

        let renderer = FileRenderer::new(&manifests, dir.path().join("rollout.yaml"));
        let res = renderer.render(None).await.unwrap();

        assert_eq!(res.objects.len(), 2);
        assert!(res.objects.contains_key("configmap.yaml"));
        assert!(res.objects.contains_key("apps/deployment.json"));
        assert_eq!(res.rollout.spec.groups[0].steps[0].object, "configmap.yaml");
    }

    #[tokio::test]
    async fn missing_rollout_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("m")).unwrap();
        let renderer = FileRenderer::new(dir.path().join("m"), dir.path().join("nope.yaml"));
        assert!(renderer.render(None).await.is_err());
    }
}
