//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quorum::adapters::{Stage, StageContext, StageRegistry};
use quorum::core::{CacheStore, Coordinator, Pipeline};
use quorum::domain::{Decision, StageResult};

/// In-process stage with a fixed answer
pub struct Scripted {
    name: String,
    result: Option<StageResult>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    seen_upstream: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl Scripted {
    pub fn answering(name: &str, result: StageResult) -> Self {
        Self {
            name: name.to_string(),
            result: Some(result),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            seen_upstream: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn voting(name: &str, decision: Decision, confidence: f64) -> Self {
        Self::answering(
            name,
            StageResult::new(decision, format!("{} says {}", name, decision), confidence)
                .with_payload(serde_json::json!({ "from": name })),
        )
    }

    /// A stage whose collaborator always errors
    pub fn failing(name: &str) -> Self {
        Self {
            result: None,
            ..Self::voting(name, Decision::Skip, 0.0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn seen_upstream(&self) -> Arc<Mutex<Vec<serde_json::Value>>> {
        self.seen_upstream.clone()
    }
}

#[async_trait]
impl Stage for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_upstream.lock().unwrap().push(ctx.upstream.clone());
        tokio::time::sleep(self.delay).await;
        match self.result {
            Some(ref result) => Ok(result.clone()),
            None => anyhow::bail!("collaborator for {} crashed", self.name),
        }
    }
}

pub fn registry(stages: Vec<Scripted>) -> StageRegistry {
    let mut registry = StageRegistry::new();
    for stage in stages {
        registry.register(Arc::new(stage));
    }
    registry
}

pub fn coordinator(root: &Path, registry: StageRegistry) -> Coordinator {
    Coordinator::new(registry, CacheStore::new(root.join("cache")), root.join("runs"))
}

pub fn pipeline(root: &Path, yaml: &str) -> Pipeline {
    Pipeline::from_yaml(yaml).unwrap().with_base_dir(root)
}

pub fn calls(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}
