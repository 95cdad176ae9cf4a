use crate::models::{Item, ScopeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-kind hooks into reconciliation. Content kinds that reference other scopes
/// (for example a kind whose items are embedded in an activity) pin bindings there.
pub trait ContentKindHandler: Send + Sync {
    /// Scopes whose label bindings must survive any move of this item untouched.
    fn extra_scopes_for_item(&self, _item: &Item) -> anyhow::Result<Vec<ScopeId>> {
        Ok(Vec::new())
    }

    /// Last word on the identifier an item gets after a collision in its new
    /// category. `proposed` is what the resolver picked.
    fn adjust_identifier(&self, _item: &Item, proposed: Option<String>) -> Option<String> {
        proposed
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StandardKind;

impl ContentKindHandler for StandardKind {}

#[derive(Clone)]
pub struct ContentKindRegistry {
    handlers: HashMap<String, Arc<dyn ContentKindHandler>>,
    fallback: Arc<dyn ContentKindHandler>,
}

impl Default for ContentKindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentKindRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(StandardKind),
        }
    }

    pub fn register(&mut self, kind: &str, handler: Arc<dyn ContentKindHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    pub fn with_handler(mut self, kind: &str, handler: Arc<dyn ContentKindHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn handler_for(&self, kind: &str) -> &dyn ContentKindHandler {
        self.handlers
            .get(kind)
            .map(|handler| handler.as_ref())
            .unwrap_or_else(|| self.fallback.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryId, EntryId};

    struct Uppercase;

    impl ContentKindHandler for Uppercase {
        fn adjust_identifier(&self, _item: &Item, proposed: Option<String>) -> Option<String> {
            proposed.map(|value| value.to_uppercase())
        }
    }

    fn item(kind: &str) -> Item {
        Item {
            entry_id: EntryId(1),
            version: 1,
            category_id: CategoryId(1),
            identifier: Some("q1".to_string()),
            kind: kind.to_string(),
        }
    }

    #[test]
    fn unknown_kinds_use_the_standard_handler() {
        let registry = ContentKindRegistry::new().with_handler("upper", Arc::new(Uppercase));

        let standard = registry.handler_for("essay");
        assert_eq!(standard.adjust_identifier(&item("essay"), Some("q2".to_string())).as_deref(), Some("q2"));
        assert!(standard.extra_scopes_for_item(&item("essay")).expect("scopes").is_empty());

        let upper = registry.handler_for("upper");
        assert_eq!(upper.adjust_identifier(&item("upper"), Some("q2".to_string())).as_deref(), Some("Q2"));
    }
}
