//! Post-test snapshots of system state
//!
//! Producers registered through [`ArtifactCollector::register`] run when the
//! test scope finishes. Each returns one resource, which is written as YAML
//! under `<artifact_dir>/<partition>[/<namespace>]/<group>_<Kind>-<name>.yaml`.

use std::any::{TypeId, type_name};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{FixtureError, FixtureResult};
use crate::scope::TestScope;

/// Annotation naming the logical partition an object belongs to
pub const PARTITION_ANNOTATION: &str = "controlplane.io/partition";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.annotations.insert(PARTITION_ANNOTATION.to_string(), partition.into());
        self
    }

    /// Partition from the annotation, empty when unset
    pub fn partition(&self) -> &str {
        self.annotations
            .get(PARTITION_ANNOTATION)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Any object that can be snapshotted as an artifact
pub trait Resource: Serialize + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Group for file names; the empty group is spelled `core`
    pub fn file_group(&self) -> &str {
        if self.group.is_empty() { "core" } else { &self.group }
    }
}

/// Registry mapping Rust types to their kind
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: HashMap<TypeId, GroupVersionKind>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: 'static>(mut self, gvk: GroupVersionKind) -> Self {
        self.kinds.insert(TypeId::of::<T>(), gvk);
        self
    }

    pub fn kind_of<T: 'static>(&self) -> Option<&GroupVersionKind> {
        self.kinds.get(&TypeId::of::<T>())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactCollector {
    primary: Arc<Scheme>,
    secondary: Arc<Scheme>,
}

impl ArtifactCollector {
    /// Kinds are looked up in `primary`, then in `secondary`
    pub fn new(primary: Scheme, secondary: Scheme) -> Self {
        Self {
            primary: Arc::new(primary),
            secondary: Arc::new(secondary),
        }
    }

    fn resolve<R: 'static>(&self) -> FixtureResult<&GroupVersionKind> {
        self.primary
            .kind_of::<R>()
            .or_else(|| self.secondary.kind_of::<R>())
            .ok_or(FixtureError::ArtifactKindUnknown {
                type_name: type_name::<R>(),
            })
    }

    /// Run `producer` when `scope` finishes and write its result
    ///
    /// Failures are reported to the scope one by one and never stop other
    /// producers.
    pub fn register<R, F, Fut>(&self, scope: &TestScope, artifact_dir: PathBuf, producer: F)
    where
        R: Resource,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let collector = self.clone();
        let reporter = scope.clone();
        scope.on_cleanup(move || async move {
            if let Err(e) = collector.collect(&artifact_dir, producer).await {
                reporter.report_error(format!("artifact collection in {} failed: {e}", artifact_dir.display()));
            }
        });
    }

    /// Produce and write one artifact now
    pub async fn collect<R, F, Fut>(&self, artifact_dir: &Path, producer: F) -> FixtureResult<PathBuf>
    where
        R: Resource,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let object = producer().await.map_err(|e| FixtureError::ArtifactProducer {
            message: format!("{e:#}"),
        })?;
        let gvk = self.resolve::<R>()?;
        let meta = object.meta();

        let dir = artifact_path_dir(artifact_dir, meta);
        let file = dir.join(sanitize(&format!("{}_{}-{}.yaml", gvk.file_group(), gvk.kind, meta.name)));
        let contents = to_yaml_with_kind(&object, gvk)?;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FixtureError::file_system("create artifact directory", &dir, e))?;
        tokio::fs::write(&file, contents)
            .await
            .map_err(|e| FixtureError::file_system("write artifact", &file, e))?;
        debug!("📦 Wrote artifact {}", file.display());
        Ok(file)
    }
}

fn sanitize(component: &str) -> String {
    component.replace(':', "_")
}

fn artifact_path_dir(artifact_dir: &Path, meta: &ObjectMeta) -> PathBuf {
    let mut dir = artifact_dir.to_path_buf();
    let partition = meta.partition();
    if !partition.is_empty() {
        dir.push(sanitize(partition));
    }
    if let Some(namespace) = meta.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        dir.push(namespace);
    }
    dir
}

/// Serialize with `apiVersion` and `kind` leading the mapping
fn to_yaml_with_kind<R: Serialize>(object: &R, gvk: &GroupVersionKind) -> FixtureResult<String> {
    let Value::Mapping(body) = serde_yaml::to_value(object)? else {
        return Err(FixtureError::ArtifactProducer {
            message: format!("{} did not serialize to a mapping", gvk.kind),
        });
    };

    let mut out = Mapping::new();
    out.insert(Value::from("apiVersion"), Value::from(gvk.api_version()));
    out.insert(Value::from("kind"), Value::from(gvk.kind.clone()));
    for (key, value) in body {
        if key.as_str().is_some_and(|k| k == "apiVersion" || k == "kind") {
            continue;
        }
        out.insert(key, value);
    }
    Ok(serde_yaml::to_string(&out)?)
}
