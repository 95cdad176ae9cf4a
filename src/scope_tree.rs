use crate::errors::{EngineError, EngineResult};
use crate::integrity::IntegrityEvent;
use crate::models::{Scope, ScopeId, ScopeKind};
use crate::store::Store;
use std::collections::HashSet;

/// Why an upward walk stopped before reaching a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainBreak {
    Missing(ScopeId),
    Cycle(ScopeId),
    DepthExceeded,
}

/// `ids[0]` is the starting scope, followed by its ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeChain {
    pub start: ScopeId,
    pub ids: Vec<ScopeId>,
    pub broken: Option<ChainBreak>,
}

impl ScopeChain {
    pub fn contains(&self, id: ScopeId) -> bool {
        self.ids.contains(&id)
    }

    pub fn integrity_event(&self) -> Option<IntegrityEvent> {
        match self.broken? {
            ChainBreak::Missing(scope_id) => Some(IntegrityEvent::MissingScope { scope_id }),
            ChainBreak::Cycle(_) | ChainBreak::DepthExceeded => {
                Some(IntegrityEvent::ScopeCycle { scope_id: self.start })
            }
        }
    }
}

/// Read-only view of the visibility hierarchy. Every walk is bounded so a
/// corrupted parent link can never hang the caller.
pub struct ScopeTree<'a, S: Store> {
    store: &'a S,
    max_depth: usize,
}

impl<'a, S: Store> ScopeTree<'a, S> {
    pub fn new(store: &'a S, max_depth: usize) -> Self {
        Self {
            store,
            max_depth: max_depth.max(1),
        }
    }

    pub fn scope(&self, id: ScopeId) -> EngineResult<Scope> {
        self.store
            .read_scope(id)?
            .ok_or_else(|| EngineError::not_found("scope", id))
    }

    pub fn kind_of(&self, id: ScopeId) -> EngineResult<Option<ScopeKind>> {
        Ok(self.store.read_scope(id)?.map(|scope| scope.kind))
    }

    pub fn scope_chain(&self, scope: ScopeId) -> EngineResult<ScopeChain> {
        let mut ids = Vec::new();
        let mut visited = HashSet::new();
        let mut broken = None;
        let mut current = Some(scope);

        while let Some(id) = current {
            if ids.len() >= self.max_depth {
                broken = Some(ChainBreak::DepthExceeded);
                break;
            }
            if !visited.insert(id) {
                broken = Some(ChainBreak::Cycle(id));
                break;
            }
            match self.store.read_scope(id)? {
                Some(found) => {
                    ids.push(found.id);
                    current = found.parent_id;
                }
                None => {
                    broken = Some(ChainBreak::Missing(id));
                    break;
                }
            }
        }

        Ok(ScopeChain {
            start: scope,
            ids,
            broken,
        })
    }

    /// True when `candidate` is `scope` or one of its ancestors. Anything past a
    /// cycle, a missing node or the depth cap counts as "not an ancestor".
    pub fn is_ancestor_or_self(&self, candidate: ScopeId, scope: ScopeId) -> EngineResult<bool> {
        Ok(self.scope_chain(scope)?.contains(candidate))
    }
}
