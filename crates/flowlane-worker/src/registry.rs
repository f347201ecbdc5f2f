//! A dictionary of action handlers keyed by action id.

use std::collections::HashMap;
use std::sync::Arc;

use flowlane_contracts::ActionHandler;

/// Maps an action id (the `action_id` field of an `Action` step) to the
/// handler that executes it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_id: impl Into<String>, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.handlers.insert(action_id.into(), handler);
        self
    }

    pub fn get(&self, action_id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_id).cloned()
    }
}
