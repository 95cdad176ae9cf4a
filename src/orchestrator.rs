use crate::category_tree::{CategoryTree, TreeChanges};
use crate::config::EngineConfig;
use crate::content_kind::ContentKindRegistry;
use crate::errors::{EngineError, EngineResult};
use crate::identifier::IdentifierResolver;
use crate::integrity::{IntegrityEvent, IntegrityObserver, TracingObserver};
use crate::labels::{LabelReconciler, ReconcileOutcome};
use crate::models::{
    Category, CategoryId, EntryId, MigrationReport, OperationKind, ScopeChange, ScopeId,
};
use crate::scope_tree::ScopeTree;
use crate::store::Store;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Entry point for structural edits. Every mutating call is one store
/// transaction; integrity repairs reach the observer only once it committed.
pub struct Orchestrator<S: Store> {
    store: Arc<S>,
    config: EngineConfig,
    kinds: ContentKindRegistry,
    observer: Arc<dyn IntegrityObserver>,
}

impl<S: Store> Orchestrator<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            kinds: ContentKindRegistry::new(),
            observer: Arc::new(TracingObserver),
        })
    }

    pub fn with_kinds(mut self, kinds: ContentKindRegistry) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn IntegrityObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn tree(&self) -> CategoryTree<'_, S> {
        CategoryTree::new(&self.store, &self.config, &self.kinds)
    }

    fn scopes(&self) -> ScopeTree<'_, S> {
        ScopeTree::new(&self.store, self.config.max_scope_depth)
    }

    fn reconciler(&self) -> LabelReconciler<'_, S> {
        LabelReconciler::new(&self.store, self.config.max_scope_depth, &self.kinds)
    }

    fn transact<T, F>(&self, operation: &'static str, operation_id: Uuid, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Vec<IntegrityEvent>) -> EngineResult<T>,
    {
        let span = tracing::info_span!("structural_edit", operation, operation_id = %operation_id);
        let _entered = span.enter();

        let mut repairs = Vec::new();
        match self.store.run_in_transaction(|| f(&mut repairs)) {
            Ok(value) => {
                for event in &repairs {
                    self.observer.record(event);
                }
                Ok(value)
            }
            Err(error) => {
                tracing::warn!(error = %error, "structural edit rolled back");
                Err(error)
            }
        }
    }

    fn execute<F>(&self, operation: OperationKind, f: F) -> EngineResult<MigrationReport>
    where
        F: FnOnce(&mut MigrationReport) -> EngineResult<()>,
    {
        let mut report = MigrationReport::new(operation);
        let operation_id = report.operation_id;
        let report = self.transact(operation.as_str(), operation_id, move |repairs| {
            f(&mut report)?;
            repairs.extend(report.repairs.iter().cloned());
            Ok(report)
        })?;

        tracing::info!(
            operation = operation.as_str(),
            operation_id = %operation_id,
            affected = report.affected_entries.len(),
            renamed = report.identifier_renames.len(),
            rebound = report.bindings_rebound,
            deleted = report.bindings_deleted,
            merged = report.bindings_merged,
            repairs = report.repairs.len(),
            "structural edit committed"
        );
        Ok(report)
    }

    /// Reconciles every item whose scope changed and folds the tree changes
    /// into `report`.
    fn settle(&self, report: &mut MigrationReport, changes: TreeChanges, moved: &[EntryId]) -> EngineResult<()> {
        let reconciler = self.reconciler();
        let mut outcome = ReconcileOutcome::default();
        for change in &changes.scope_changes {
            let item = self
                .store
                .read_item(change.entry_id)?
                .ok_or_else(|| EngineError::not_found("entry", change.entry_id))?;
            outcome.absorb(reconciler.reconcile(&item, change.old_scope_id, change.new_scope_id)?);
        }

        let affected: BTreeSet<EntryId> = changes
            .scope_changes
            .iter()
            .map(|change| change.entry_id)
            .chain(changes.renames.iter().map(|rename| rename.entry_id))
            .chain(moved.iter().copied())
            .collect();
        report.affected_entries.extend(affected);
        report.identifier_renames.extend(changes.renames);
        report.categories_created.extend(changes.created);
        report.categories_deleted.extend(changes.deleted);
        report.repairs.extend(changes.repairs);
        report.bindings_rebound += outcome.rebound;
        report.bindings_deleted += outcome.deleted;
        report.bindings_merged += outcome.merged;
        // A broken scope chain is seen once per reconciled item.
        for event in outcome.repairs {
            if !report.repairs.contains(&event) {
                report.repairs.push(event);
            }
        }
        Ok(())
    }

    /// Moves a category and its whole subtree into another scope.
    pub fn move_category(&self, category_id: CategoryId, destination_scope_id: ScopeId) -> EngineResult<MigrationReport> {
        self.execute(OperationKind::MoveCategory, |report| {
            let tree = self.tree();
            let category = tree.category(category_id)?;
            self.scopes().scope(destination_scope_id)?;
            if category.scope_id == destination_scope_id {
                return Ok(());
            }
            let mut changes = TreeChanges::default();
            tree.relocate(category_id, destination_scope_id, &mut changes)?;
            self.settle(report, changes, &[])
        })
    }

    pub fn reparent_category(&self, category_id: CategoryId, new_parent_id: CategoryId) -> EngineResult<MigrationReport> {
        self.execute(OperationKind::ReparentCategory, |report| {
            let mut changes = TreeChanges::default();
            self.tree().reparent(category_id, new_parent_id, &mut changes)?;
            self.settle(report, changes, &[])
        })
    }

    /// Deletes a category subtree. Items it holds are moved to `rescue_category_id`
    /// or to an automatically created rescue category.
    pub fn delete_category(
        &self,
        category_id: CategoryId,
        rescue_category_id: Option<CategoryId>,
    ) -> EngineResult<MigrationReport> {
        self.execute(OperationKind::DeleteCategory, |report| {
            let mut changes = TreeChanges::default();
            self.tree().delete_safe(category_id, rescue_category_id, &mut changes)?;
            self.settle(report, changes, &[])
        })
    }

    fn move_item(
        &self,
        entry_id: EntryId,
        destination: &Category,
        taken: &mut HashSet<String>,
        changes: &mut TreeChanges,
    ) -> EngineResult<bool> {
        let tree = self.tree();
        let item = self
            .store
            .read_item(entry_id)?
            .ok_or_else(|| EngineError::not_found("entry", entry_id))?;
        if item.category_id == destination.id {
            return Ok(false);
        }
        let source = tree.category(item.category_id)?;
        tree.transfer_item(&item, destination, taken, changes)?;
        if source.scope_id != destination.scope_id {
            changes.scope_changes.push(ScopeChange {
                entry_id,
                old_scope_id: source.scope_id,
                new_scope_id: destination.scope_id,
            });
        }
        Ok(true)
    }

    /// Moves one item into another category, renaming its identifier when the
    /// destination already uses it.
    pub fn change_item_category(&self, entry_id: EntryId, destination_category_id: CategoryId) -> EngineResult<MigrationReport> {
        self.move_items(OperationKind::ChangeItemCategory, &[entry_id], destination_category_id)
    }

    pub fn move_items_to_category(
        &self,
        entry_ids: &[EntryId],
        destination_category_id: CategoryId,
    ) -> EngineResult<MigrationReport> {
        self.move_items(OperationKind::MoveItems, entry_ids, destination_category_id)
    }

    fn move_items(
        &self,
        operation: OperationKind,
        entry_ids: &[EntryId],
        destination_category_id: CategoryId,
    ) -> EngineResult<MigrationReport> {
        self.execute(operation, |report| {
            let destination = self.tree().category(destination_category_id)?;
            let mut taken = self.store.list_identifiers_in_category(destination.id)?;
            let mut changes = TreeChanges::default();
            let mut moved = Vec::with_capacity(entry_ids.len());
            for entry_id in entry_ids {
                if self.move_item(*entry_id, &destination, &mut taken, &mut changes)? {
                    moved.push(*entry_id);
                }
            }
            self.settle(report, changes, &moved)
        })
    }

    /// Moves the whole category tree of a retired scope into another scope.
    pub fn move_scope_content(&self, from_scope_id: ScopeId, to_scope_id: ScopeId) -> EngineResult<MigrationReport> {
        self.execute(OperationKind::MoveScopeContent, |report| {
            let scopes = self.scopes();
            scopes.scope(from_scope_id)?;
            scopes.scope(to_scope_id)?;
            if from_scope_id == to_scope_id {
                return Ok(());
            }
            let mut changes = TreeChanges::default();
            self.tree().relocate_scope(from_scope_id, to_scope_id, &mut changes)?;
            self.settle(report, changes, &[])
        })
    }

    pub fn create_category(&self, scope_id: ScopeId, parent_id: Option<CategoryId>, name: &str) -> EngineResult<Category> {
        self.transact("create-category", Uuid::new_v4(), |repairs| {
            let mut changes = TreeChanges::default();
            let category = self.tree().create_category(scope_id, parent_id, name, &mut changes)?;
            repairs.extend(changes.repairs);
            Ok(category)
        })
    }

    pub fn ensure_top_category(&self, scope_id: ScopeId) -> EngineResult<Category> {
        self.transact("ensure-top-category", Uuid::new_v4(), |repairs| {
            let mut changes = TreeChanges::default();
            let top = self.tree().ensure_top(scope_id, &mut changes)?;
            repairs.extend(changes.repairs);
            Ok(top)
        })
    }

    pub fn list_subtree(&self, category_id: CategoryId) -> EngineResult<Vec<CategoryId>> {
        self.tree().list_subtree(category_id)
    }

    /// Read-only, so a corrupted link found on the way up goes straight to the observer.
    pub fn list_ancestors(&self, category_id: CategoryId) -> EngineResult<Vec<CategoryId>> {
        let walk = self.tree().walk_ancestors(category_id)?;
        if let Some(event) = &walk.anomaly {
            self.observer.record(event);
        }
        Ok(walk.ids)
    }

    pub fn next_unused_identifier(&self, candidate: Option<&str>, category_id: CategoryId) -> EngineResult<Option<String>> {
        self.tree().category(category_id)?;
        IdentifierResolver::new(&*self.store, self.config.identifier_suffix_fallback).next_unused(candidate, category_id)
    }

    pub fn is_latest(&self, version: i64, entry_id: EntryId) -> EngineResult<bool> {
        self.store.is_latest(version, entry_id)
    }

    pub fn is_ancestor_or_self(&self, candidate: ScopeId, scope_id: ScopeId) -> EngineResult<bool> {
        self.scopes().is_ancestor_or_self(candidate, scope_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_kind::ContentKindHandler;
    use crate::integrity::RecordingObserver;
    use crate::models::{Item, ScopeKind};
    use crate::store::SqliteStore;

    fn engine() -> Orchestrator<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        Orchestrator::new(store, EngineConfig::default()).expect("engine")
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let config = EngineConfig {
            max_category_depth: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(Orchestrator::new(store, config), Err(EngineError::Config(_))));
    }

    #[test]
    fn moving_into_the_current_scope_is_a_noop() {
        let engine = engine();
        let course = engine.store().insert_scope(ScopeKind::Course, None).expect("scope");
        let category = engine.create_category(course.id, None, "week 1").expect("category");

        let report = engine.move_category(category.id, course.id).expect("move");
        assert!(report.is_noop());
        assert_eq!(report.operation, OperationKind::MoveCategory);
    }

    #[test]
    fn missing_targets_are_not_found() {
        let engine = engine();
        let course = engine.store().insert_scope(ScopeKind::Course, None).expect("scope");
        let category = engine.create_category(course.id, None, "week 1").expect("category");

        assert!(matches!(engine.move_category(CategoryId(999), course.id), Err(EngineError::NotFound(_))));
        assert!(matches!(engine.move_category(category.id, ScopeId(999)), Err(EngineError::NotFound(_))));
        assert!(matches!(
            engine.change_item_category(EntryId(999), category.id),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.next_unused_identifier(Some("q1"), CategoryId(999)),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn create_category_rejects_a_parent_in_another_scope() {
        let engine = engine();
        let a = engine.store().insert_scope(ScopeKind::Course, None).expect("a");
        let b = engine.store().insert_scope(ScopeKind::Course, None).expect("b");
        let in_a = engine.create_category(a.id, None, "in a").expect("category");

        let err = engine.create_category(b.id, Some(in_a.id), "wrong").expect_err("cross scope");
        assert!(matches!(err, EngineError::InvalidStructure(_)));
        assert_eq!(engine.store().count_categories(b.id).expect("count"), 0);
    }

    #[test]
    fn repairs_reach_the_observer_after_commit() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let observer = Arc::new(RecordingObserver::new());
        let engine = Orchestrator::new(store, EngineConfig::default())
            .expect("engine")
            .with_observer(observer.clone());
        let global = engine.store().insert_scope(ScopeKind::Global, None).expect("global");
        let course = engine.store().insert_scope(ScopeKind::Course, Some(global.id)).expect("course");
        let category = engine.create_category(course.id, None, "c1").expect("category");
        let item = engine.store().insert_item(category.id, Some("q1"), "essay").expect("item");
        let stale = engine
            .store()
            .insert_binding(item.entry_id, "legacy", ScopeId(404))
            .expect("binding");

        let report = engine.move_category(category.id, global.id).expect("move");

        let expected = IntegrityEvent::StaleBindingAnchor {
            binding_id: stale.id,
            entry_id: item.entry_id,
            from_scope_id: ScopeId(404),
            to_scope_id: global.id,
        };
        assert_eq!(report.repairs, vec![expected.clone()]);
        assert_eq!(observer.events(), vec![expected]);
    }

    struct Broken;

    impl ContentKindHandler for Broken {
        fn extra_scopes_for_item(&self, _item: &Item) -> anyhow::Result<Vec<ScopeId>> {
            anyhow::bail!("handler lost its backing activity")
        }
    }

    #[test]
    fn failure_midway_rolls_back_and_reports_nothing() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let observer = Arc::new(RecordingObserver::new());
        let engine = Orchestrator::new(store, EngineConfig::default())
            .expect("engine")
            .with_kinds(ContentKindRegistry::new().with_handler("broken", Arc::new(Broken)))
            .with_observer(observer.clone());
        let course_x = engine.store().insert_scope(ScopeKind::Course, None).expect("x");
        let course_y = engine.store().insert_scope(ScopeKind::Course, None).expect("y");
        let category = engine.create_category(course_x.id, None, "c1").expect("category");
        let item = engine.store().insert_item(category.id, Some("q1"), "broken").expect("item");
        engine.store().insert_binding(item.entry_id, "foo", course_x.id).expect("binding");
        engine.store().insert_binding(item.entry_id, "gone", ScopeId(404)).expect("binding");

        let err = engine.move_category(category.id, course_y.id).expect_err("handler failure");
        assert!(matches!(err, EngineError::Internal(_)));

        let unchanged = engine.tree().category(category.id).expect("category");
        assert_eq!(unchanged.scope_id, course_x.id);
        assert_eq!(engine.store().count_categories(course_y.id).expect("count"), 0);
        let bindings = engine.store().list_bindings_for_item(item.entry_id).expect("bindings");
        assert_eq!(bindings[0].scope_id, course_x.id);
        assert!(observer.events().is_empty());
    }
}
