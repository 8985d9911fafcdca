/// Hot-swap pipeline registry using ArcSwap
///
/// Maps assistant ids to pipelines. Every update swaps the whole map pointer, so
/// execution units resolving a pipeline never block on a writer and runs already
/// in flight keep the pipeline they started with.

use crate::pipeline::Pipeline;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free assistant registry
pub struct PipelineRegistry {
    /// Key: assistant_id, Value: pipeline serving it
    pipelines: ArcSwap<HashMap<String, Arc<dyn Pipeline>>>,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("assistants", &self.assistant_ids())
            .finish()
    }
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            pipelines: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Register or replace the pipeline serving `assistant_id`
    pub fn register(&self, assistant_id: impl Into<String>, pipeline: Arc<dyn Pipeline>) {
        let assistant_id = assistant_id.into();

        // Clone current map and swap in the updated one
        let current = self.pipelines.load();
        let mut next = (**current).clone();
        let replaced = next.insert(assistant_id.clone(), pipeline).is_some();
        self.pipelines.store(Arc::new(next));

        if replaced {
            tracing::info!("🔁 Replaced pipeline for assistant: {}", assistant_id);
        } else {
            tracing::info!("🧩 Registered pipeline for assistant: {}", assistant_id);
        }
    }

    pub fn remove(&self, assistant_id: &str) -> bool {
        let current = self.pipelines.load();
        let mut next = (**current).clone();

        if next.remove(assistant_id).is_some() {
            self.pipelines.store(Arc::new(next));
            tracing::info!("Removed pipeline for assistant: {}", assistant_id);
            true
        } else {
            false
        }
    }

    /// Lock-free lookup
    pub fn resolve(&self, assistant_id: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.load().get(assistant_id).cloned()
    }

    pub fn assistant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.load().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ScriptedPipeline, Step};

    fn empty_pipeline() -> Arc<dyn Pipeline> {
        Arc::new(ScriptedPipeline::new(|_| Vec::<Step>::new()))
    }

    #[test]
    fn register_resolve_and_remove() {
        let registry = PipelineRegistry::new();
        registry.register("research", empty_pipeline());
        registry.register("outline", empty_pipeline());

        assert!(registry.resolve("research").is_some());
        assert!(registry.resolve("unknown").is_none());
        assert_eq!(registry.assistant_ids(), vec!["outline", "research"]);

        assert!(registry.remove("outline"));
        assert!(!registry.remove("outline"));
        assert_eq!(registry.assistant_ids(), vec!["research"]);
    }

    #[test]
    fn resolved_pipelines_survive_replacement() {
        let registry = PipelineRegistry::new();
        let first = empty_pipeline();
        registry.register("research", first.clone());

        let held = registry.resolve("research").expect("registered");
        registry.register("research", empty_pipeline());

        assert!(Arc::ptr_eq(&held, &first));
        let current = registry.resolve("research").expect("still registered");
        assert!(!Arc::ptr_eq(&current, &first));
    }
}
