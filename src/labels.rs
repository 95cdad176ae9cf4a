use crate::content_kind::ContentKindRegistry;
use crate::errors::EngineResult;
use crate::integrity::IntegrityEvent;
use crate::models::{Item, LabelBinding, ScopeId, ScopeKind};
use crate::scope_tree::{ScopeChain, ScopeTree};
use crate::store::Store;
use std::collections::HashSet;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub rebound: usize,
    pub kept: usize,
    pub deleted: usize,
    pub merged: usize,
    pub repairs: Vec<IntegrityEvent>,
}

impl ReconcileOutcome {
    pub fn absorb(&mut self, other: ReconcileOutcome) {
        self.rebound += other.rebound;
        self.kept += other.kept;
        self.deleted += other.deleted;
        self.merged += other.merged;
        self.repairs.extend(other.repairs);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Rebind { stale: bool },
    Keep,
    Delete,
}

/// Rewrites the label bindings of one item after its category scope changed.
pub struct LabelReconciler<'a, S: Store> {
    store: &'a S,
    scopes: ScopeTree<'a, S>,
    kinds: &'a ContentKindRegistry,
}

impl<'a, S: Store> LabelReconciler<'a, S> {
    pub fn new(store: &'a S, max_scope_depth: usize, kinds: &'a ContentKindRegistry) -> Self {
        Self {
            store,
            scopes: ScopeTree::new(store, max_scope_depth),
            kinds,
        }
    }

    fn classify(
        &self,
        binding: &LabelBinding,
        old_scope: ScopeId,
        new_scope: ScopeId,
        pinned: &HashSet<ScopeId>,
        new_chain: &mut Option<ScopeChain>,
    ) -> EngineResult<Disposition> {
        if binding.scope_id == old_scope {
            return Ok(Disposition::Rebind { stale: false });
        }
        if binding.scope_id == new_scope || pinned.contains(&binding.scope_id) {
            return Ok(Disposition::Keep);
        }
        match self.scopes.kind_of(binding.scope_id)? {
            Some(ScopeKind::Course) => {
                if new_chain.is_none() {
                    *new_chain = Some(self.scopes.scope_chain(new_scope)?);
                }
                let reachable = new_chain
                    .as_ref()
                    .is_some_and(|chain| chain.contains(binding.scope_id));
                if reachable {
                    Ok(Disposition::Keep)
                } else {
                    Ok(Disposition::Delete)
                }
            }
            _ => Ok(Disposition::Rebind { stale: true }),
        }
    }

    pub fn reconcile(&self, item: &Item, old_scope: ScopeId, new_scope: ScopeId) -> EngineResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        if old_scope == new_scope {
            return Ok(outcome);
        }

        let bindings = self.store.list_bindings_for_item(item.entry_id)?;
        if bindings.is_empty() {
            return Ok(outcome);
        }
        let pinned: HashSet<ScopeId> = self
            .kinds
            .handler_for(&item.kind)
            .extra_scopes_for_item(item)?
            .into_iter()
            .collect();

        let mut new_chain = None;
        let mut survivors: Vec<LabelBinding> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match self.classify(&binding, old_scope, new_scope, &pinned, &mut new_chain)? {
                Disposition::Rebind { stale } => {
                    if stale {
                        tracing::warn!(
                            binding_id = %binding.id,
                            entry_id = %item.entry_id,
                            from = %binding.scope_id,
                            to = %new_scope,
                            "rebinding label with a stale anchor"
                        );
                        outcome.repairs.push(IntegrityEvent::StaleBindingAnchor {
                            binding_id: binding.id,
                            entry_id: item.entry_id,
                            from_scope_id: binding.scope_id,
                            to_scope_id: new_scope,
                        });
                    }
                    let rebound = LabelBinding {
                        scope_id: new_scope,
                        ..binding
                    };
                    self.store.write_binding(&rebound)?;
                    outcome.rebound += 1;
                    survivors.push(rebound);
                }
                Disposition::Keep => {
                    outcome.kept += 1;
                    survivors.push(binding);
                }
                Disposition::Delete => {
                    self.store.delete_binding(binding.id)?;
                    outcome.deleted += 1;
                }
            }
        }

        if let Some(event) = new_chain.as_ref().and_then(ScopeChain::integrity_event) {
            tracing::warn!(
                entry_id = %item.entry_id,
                scope_id = %new_scope,
                code = event.code(),
                "scope chain is broken; course bindings past the break were dropped"
            );
            outcome.repairs.push(event);
        }

        // Lowest id wins for each (label, scope).
        survivors.sort_by_key(|binding| binding.id);
        let mut seen: HashSet<(String, ScopeId)> = HashSet::new();
        for binding in survivors {
            if !seen.insert((binding.label.clone(), binding.scope_id)) {
                self.store.delete_binding(binding.id)?;
                outcome.merged += 1;
            }
        }

        tracing::debug!(
            entry_id = %item.entry_id,
            old_scope = %old_scope,
            new_scope = %new_scope,
            rebound = outcome.rebound,
            kept = outcome.kept,
            deleted = outcome.deleted,
            merged = outcome.merged,
            "reconciled label bindings"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_kind::ContentKindHandler;
    use crate::models::{NewCategory, Scope};
    use crate::store::SqliteStore;
    use std::sync::Arc;

    struct World {
        store: SqliteStore,
        kinds: ContentKindRegistry,
        global: Scope,
        group: Scope,
        course_x: Scope,
        course_y: Scope,
    }

    impl World {
        fn new() -> Self {
            let store = SqliteStore::open_in_memory().expect("store");
            let global = store.insert_scope(ScopeKind::Global, None).expect("global");
            let group = store.insert_scope(ScopeKind::Group, Some(global.id)).expect("group");
            let course_x = store.insert_scope(ScopeKind::Course, Some(group.id)).expect("x");
            let course_y = store.insert_scope(ScopeKind::Course, Some(group.id)).expect("y");
            Self {
                store,
                kinds: ContentKindRegistry::new(),
                global,
                group,
                course_x,
                course_y,
            }
        }

        fn item_in(&self, scope_id: ScopeId, kind: &str) -> Item {
            let category = self
                .store
                .insert_category(&NewCategory {
                    scope_id,
                    parent_id: None,
                    name: "c1".to_string(),
                    is_top: false,
                })
                .expect("category");
            self.store.insert_item(category.id, Some("q1"), kind).expect("item")
        }

        fn reconciler(&self) -> LabelReconciler<'_, SqliteStore> {
            LabelReconciler::new(&self.store, 16, &self.kinds)
        }

        fn bindings(&self, item: &Item) -> Vec<(String, ScopeId)> {
            self.store
                .list_bindings_for_item(item.entry_id)
                .expect("bindings")
                .into_iter()
                .map(|binding| (binding.label, binding.scope_id))
                .collect()
        }
    }

    #[test]
    fn item_level_labels_follow_the_item_and_foreign_course_labels_are_dropped() {
        let world = World::new();
        let item = world.item_in(world.course_x.id, "essay");
        world.store.insert_binding(item.entry_id, "foo", world.course_x.id).expect("foo");
        world.store.insert_binding(item.entry_id, "ctag", world.course_y.id).expect("ctag");

        let outcome = world
            .reconciler()
            .reconcile(&item, world.course_x.id, world.group.id)
            .expect("reconcile");

        assert_eq!(world.bindings(&item), vec![("foo".to_string(), world.group.id)]);
        assert_eq!(outcome.rebound, 1);
        assert_eq!(outcome.deleted, 1);
        assert!(outcome.repairs.is_empty());
    }

    #[test]
    fn course_labels_survive_while_the_course_remains_an_ancestor() {
        let world = World::new();
        let activity = world
            .store
            .insert_scope(ScopeKind::Activity, Some(world.course_x.id))
            .expect("activity");
        let item = world.item_in(world.global.id, "essay");
        world.store.insert_binding(item.entry_id, "ctag", world.course_x.id).expect("ctag");

        let outcome = world
            .reconciler()
            .reconcile(&item, world.global.id, activity.id)
            .expect("reconcile");

        assert_eq!(world.bindings(&item), vec![("ctag".to_string(), world.course_x.id)]);
        assert_eq!(outcome.kept, 1);
    }

    #[test]
    fn stale_anchors_are_rebound_and_reported() {
        let world = World::new();
        let item = world.item_in(world.course_x.id, "essay");
        let stale = world.store.insert_binding(item.entry_id, "old", world.global.id).expect("stale");
        let missing = world.store.insert_binding(item.entry_id, "gone", ScopeId(404)).expect("missing");

        let outcome = world
            .reconciler()
            .reconcile(&item, world.course_x.id, world.course_y.id)
            .expect("reconcile");

        assert_eq!(
            world.bindings(&item),
            vec![("old".to_string(), world.course_y.id), ("gone".to_string(), world.course_y.id)]
        );
        assert_eq!(outcome.repairs.len(), 2);
        assert!(outcome.repairs.contains(&IntegrityEvent::StaleBindingAnchor {
            binding_id: stale.id,
            entry_id: item.entry_id,
            from_scope_id: world.global.id,
            to_scope_id: world.course_y.id,
        }));
        assert!(outcome.repairs.iter().any(|event| matches!(
            event,
            IntegrityEvent::StaleBindingAnchor { binding_id, .. } if *binding_id == missing.id
        )));
    }

    #[test]
    fn duplicates_created_by_rebinding_are_merged_keeping_the_oldest() {
        let world = World::new();
        let item = world.item_in(world.course_x.id, "essay");
        let first = world.store.insert_binding(item.entry_id, "foo", world.course_x.id).expect("first");
        world.store.insert_binding(item.entry_id, "foo", world.global.id).expect("second");
        world.store.insert_binding(item.entry_id, "foo", world.group.id).expect("third");

        let outcome = world
            .reconciler()
            .reconcile(&item, world.course_x.id, world.group.id)
            .expect("reconcile");

        let remaining = world.store.list_bindings_for_item(item.entry_id).expect("bindings");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, first.id);
        assert_eq!(remaining[0].scope_id, world.group.id);
        assert_eq!(outcome.merged, 2);
    }

    #[test]
    fn reconciling_into_the_same_scope_changes_nothing() {
        let world = World::new();
        let item = world.item_in(world.course_x.id, "essay");
        world.store.insert_binding(item.entry_id, "foo", world.course_x.id).expect("foo");
        world.store.insert_binding(item.entry_id, "foo", world.course_x.id).expect("dup");
        world.store.insert_binding(item.entry_id, "ctag", world.course_y.id).expect("ctag");
        let before = world.store.list_bindings_for_item(item.entry_id).expect("before");

        let outcome = world
            .reconciler()
            .reconcile(&item, world.course_x.id, world.course_x.id)
            .expect("reconcile");

        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(world.store.list_bindings_for_item(item.entry_id).expect("after"), before);
    }

    #[test]
    fn a_cyclic_destination_chain_drops_course_labels_and_is_reported() {
        let world = World::new();
        let first = world.store.insert_scope(ScopeKind::Group, Some(world.global.id)).expect("first");
        let second = world.store.insert_scope(ScopeKind::Group, Some(first.id)).expect("second");
        world.store.set_scope_parent(first.id, Some(second.id)).expect("close the loop");
        let course = world.store.insert_scope(ScopeKind::Course, Some(first.id)).expect("course");
        let item = world.item_in(course.id, "essay");
        world.store.insert_binding(item.entry_id, "foo", course.id).expect("foo");
        world.store.insert_binding(item.entry_id, "ctag", world.course_y.id).expect("ctag");

        let outcome = world
            .reconciler()
            .reconcile(&item, course.id, second.id)
            .expect("reconcile terminates");

        assert_eq!(world.bindings(&item), vec![("foo".to_string(), second.id)]);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.repairs, vec![IntegrityEvent::ScopeCycle { scope_id: second.id }]);
    }

    #[test]
    fn healthy_chains_report_nothing() {
        let world = World::new();
        let item = world.item_in(world.course_x.id, "essay");
        world.store.insert_binding(item.entry_id, "ctag", world.course_y.id).expect("ctag");

        let outcome = world
            .reconciler()
            .reconcile(&item, world.course_x.id, world.global.id)
            .expect("reconcile");

        assert_eq!(outcome.deleted, 1);
        assert!(outcome.repairs.is_empty());
    }

    struct PinnedToCourse(ScopeId);

    impl ContentKindHandler for PinnedToCourse {
        fn extra_scopes_for_item(&self, _item: &Item) -> anyhow::Result<Vec<ScopeId>> {
            Ok(vec![self.0])
        }
    }

    #[test]
    fn kind_pinned_scopes_are_left_alone() {
        let mut world = World::new();
        world.kinds.register("embedded", Arc::new(PinnedToCourse(world.course_y.id)));
        let item = world.item_in(world.course_x.id, "embedded");
        world.store.insert_binding(item.entry_id, "ctag", world.course_y.id).expect("ctag");

        let outcome = world
            .reconciler()
            .reconcile(&item, world.course_x.id, world.global.id)
            .expect("reconcile");

        assert_eq!(world.bindings(&item), vec![("ctag".to_string(), world.course_y.id)]);
        assert_eq!(outcome.kept, 1);
    }
}
