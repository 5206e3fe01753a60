//! The executable step protocol and the shared working tree.

use async_trait::async_trait;
use crucible_core::abort::AbortReceiver;
use crucible_core::ports::Container;
use crucible_core::versions::Version;
use crucible_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One executable node of a compiled plan.
///
/// Steps consume themselves: composition steps hand child contexts out and
/// aggregate children run as independent tasks.
#[async_trait]
pub trait Step: Send + 'static {
    async fn run(self: Box<Self>, ctx: StepContext) -> Result<StepOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub succeeded: bool,
}

impl StepOutcome {
    pub fn new(succeeded: bool) -> Self {
        Self { succeeded }
    }
}

/// Everything a step needs from its surroundings: the abort signal, the
/// shared working tree, and the overall success so far (for conditionals
/// and pass-through steps).
#[derive(Clone)]
pub struct StepContext {
    pub abort: AbortReceiver,
    pub artifacts: Arc<WorkingTree>,
    pub prior_succeeded: Option<bool>,
}

impl StepContext {
    pub fn new(abort: AbortReceiver, artifacts: Arc<WorkingTree>) -> Self {
        Self {
            abort,
            artifacts,
            prior_succeeded: None,
        }
    }

    pub fn with_prior(mut self, succeeded: Option<bool>) -> Self {
        self.prior_succeeded = succeeded;
        self
    }
}

/// The named working-tree slots a build's steps read and write, plus the
/// versions produced by puts so their dependent gets know what to fetch.
#[derive(Default)]
pub struct WorkingTree {
    slots: RwLock<HashMap<String, Arc<Artifact>>>,
    produced: RwLock<HashMap<String, Version>>,
}

impl WorkingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str, artifact: Artifact) {
        self.slots
            .write()
            .await
            .insert(name.to_string(), Arc::new(artifact));
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Artifact>> {
        self.slots.read().await.get(name).cloned()
    }

    pub async fn all(&self) -> Vec<(String, Arc<Artifact>)> {
        let slots = self.slots.read().await;
        let mut entries: Vec<_> = slots
            .iter()
            .map(|(name, artifact)| (name.clone(), artifact.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Records the version a put just produced for its resource.
    pub async fn record_produced(&self, resource: &str, version: Version) {
        self.produced
            .write()
            .await
            .insert(resource.to_string(), version);
    }

    pub async fn produced(&self, resource: &str) -> Option<Version> {
        self.produced.read().await.get(resource).cloned()
    }

    /// Releases every registered artifact's container.
    pub async fn release_all(&self) {
        for (_, artifact) in self.slots.read().await.iter() {
            artifact.container.release();
        }
    }
}

/// A named directory some step produced, backed by its container.
pub struct Artifact {
    container: Arc<dyn Container>,
    root: String,
}

impl Artifact {
    pub fn new(container: Arc<dyn Container>, root: impl Into<String>) -> Self {
        Self {
            container,
            root: root.into(),
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.container
            .stream_out(&format!("{}/{}", self.root, path))
            .await
    }

    /// Copies this artifact into `dest` at `dest_path`.
    pub async fn stream_to(&self, dest: &dyn Container, dest_path: &str) -> Result<()> {
        let bits = self.container.stream_out(&self.root).await?;
        dest.stream_in(dest_path, &bits).await
    }
}
