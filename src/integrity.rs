use crate::models::{BindingId, CategoryId, EntryId, ScopeId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Latent corruption found (and repaired where possible) while an operation ran.
/// These never abort the operation that found them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IntegrityEvent {
    #[serde(rename_all = "camelCase")]
    CrossScopeParent {
        category_id: CategoryId,
        category_scope_id: ScopeId,
        parent_id: CategoryId,
        parent_scope_id: ScopeId,
    },
    #[serde(rename_all = "camelCase")]
    MissingParentCategory {
        category_id: CategoryId,
        parent_id: CategoryId,
    },
    #[serde(rename_all = "camelCase")]
    CategoryCycle { category_id: CategoryId },
    #[serde(rename_all = "camelCase")]
    CategoryDepthExceeded { category_id: CategoryId, limit: usize },
    #[serde(rename_all = "camelCase")]
    DuplicateTopCategory {
        scope_id: ScopeId,
        kept: CategoryId,
        duplicate: CategoryId,
    },
    #[serde(rename_all = "camelCase")]
    MissingScope { scope_id: ScopeId },
    #[serde(rename_all = "camelCase")]
    ScopeCycle { scope_id: ScopeId },
    #[serde(rename_all = "camelCase")]
    StaleBindingAnchor {
        binding_id: BindingId,
        entry_id: EntryId,
        from_scope_id: ScopeId,
        to_scope_id: ScopeId,
    },
}

impl IntegrityEvent {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CrossScopeParent { .. } => "cross-scope-parent",
            Self::MissingParentCategory { .. } => "missing-parent-category",
            Self::CategoryCycle { .. } => "category-cycle",
            Self::CategoryDepthExceeded { .. } => "category-depth-exceeded",
            Self::DuplicateTopCategory { .. } => "duplicate-top-category",
            Self::MissingScope { .. } => "missing-scope",
            Self::ScopeCycle { .. } => "scope-cycle",
            Self::StaleBindingAnchor { .. } => "stale-binding-anchor",
        }
    }
}

/// Observability collaborator that operators use to notice latent corruption.
pub trait IntegrityObserver: Send + Sync {
    fn record(&self, event: &IntegrityEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl IntegrityObserver for TracingObserver {
    fn record(&self, event: &IntegrityEvent) {
        let detail = serde_json::to_string(event).unwrap_or_default();
        tracing::warn!(code = event.code(), detail = %detail, "data integrity repaired");
    }
}

/// Keeps every event in memory; useful for callers that surface repairs in a UI.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<IntegrityEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IntegrityEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl IntegrityObserver for RecordingObserver {
    fn record(&self, event: &IntegrityEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
