/// Hot-reload workflow registry using ArcSwap
///
/// Deployed definitions are parsed once and kept as immutable `Arc<Workflow>`
/// values. Every deploy or removal swaps the whole map, so readers never block
/// and an instance already running keeps the `Arc` it loaded.

use crate::error::{ParseError, StoreError};
use crate::store::PersistenceStore;
use crate::workflow::capabilities::Capabilities;
use crate::workflow::ids::WorkflowId;
use crate::workflow::model::Workflow;
use crate::workflow::parser;
use crate::workflow::types::WorkflowSource;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow id, Value: parsed definition
    workflows: ArcSwap<HashMap<WorkflowId, Arc<Workflow>>>,
    /// Activity and trigger types available to parsed definitions
    capabilities: Capabilities,
}

impl WorkflowRegistry {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Parse a source and publish it, replacing any previous version
    pub fn deploy(&self, source: &WorkflowSource) -> Result<Arc<Workflow>, ParseError> {
        let workflow = Arc::new(parser::parse(source, &self.capabilities)?);

        let published = workflow.clone();
        self.workflows.rcu(move |current| {
            let mut next = (**current).clone();
            next.insert(published.id.clone(), published.clone());
            next
        });

        tracing::info!("🔥 Deployed workflow {} ({})", workflow.id, workflow.name);
        Ok(workflow)
    }

    /// Lock-free lookup
    pub fn get(&self, id: &WorkflowId) -> Option<Arc<Workflow>> {
        self.workflows.load().get(id).cloned()
    }

    pub fn remove(&self, id: &WorkflowId) -> bool {
        if !self.workflows.load().contains_key(id) {
            return false;
        }
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(id);
            next
        });
        tracing::info!("🗑️ Removed workflow {} from registry", id);
        true
    }

    pub fn list_ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<_> = self.workflows.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Load and parse every stored source. Sources that no longer parse are
    /// logged and skipped. Returns the number of deployed workflows.
    pub async fn init_from_store(&self, store: &dyn PersistenceStore) -> Result<usize, StoreError> {
        let sources = store.load_workflow_sources().await?;

        let mut loaded = HashMap::new();
        for source in &sources {
            match parser::parse(source, &self.capabilities) {
                Ok(workflow) => {
                    loaded.insert(workflow.id.clone(), Arc::new(workflow));
                }
                Err(e) => tracing::warn!("⚠️ Skipping stored workflow {}: {}", source.id, e),
            }
        }

        let count = loaded.len();
        self.workflows.store(Arc::new(loaded));
        tracing::info!("Initialized workflow registry with {} workflows", count);
        Ok(count)
    }
}
