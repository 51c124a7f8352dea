//! Running-pipeline registry
//!
//! One entry per executing pipeline id. Admission uses it to reject a
//! duplicate id while the first run is still in flight; the executor removes
//! its entry on every exit path, after which the id can be reused.

use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Default)]
pub struct PipelineRegistry {
    running: RwLock<HashSet<String>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a pipeline id; returns false if it is already executing
    pub fn register(&self, pipeline_id: &str) -> bool {
        self.running.write().unwrap().insert(pipeline_id.to_string())
    }

    /// Releases a pipeline id
    pub fn remove(&self, pipeline_id: &str) {
        self.running.write().unwrap().remove(pipeline_id);
    }

    pub fn is_running(&self, pipeline_id: &str) -> bool {
        self.running.read().unwrap().contains(pipeline_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_release() {
        let registry = PipelineRegistry::new();

        assert!(registry.register("p-1"));
        assert!(!registry.register("p-1"));
        assert!(registry.is_running("p-1"));

        registry.remove("p-1");
        assert!(!registry.is_running("p-1"));
        assert!(registry.register("p-1"));
    }
}
