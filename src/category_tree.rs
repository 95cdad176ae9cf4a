use crate::config::EngineConfig;
use crate::content_kind::ContentKindRegistry;
use crate::errors::{EngineError, EngineResult};
use crate::identifier::IdentifierResolver;
use crate::integrity::IntegrityEvent;
use crate::models::{
    Category, CategoryId, IdentifierRename, Item, NewCategory, ScopeChange, ScopeId,
};
use crate::store::Store;
use std::collections::{HashMap, HashSet, VecDeque};

/// Everything a structural edit did, accumulated across the steps of one operation.
#[derive(Debug, Default, Clone)]
pub struct TreeChanges {
    pub created: Vec<CategoryId>,
    pub deleted: Vec<CategoryId>,
    pub scope_changes: Vec<ScopeChange>,
    pub renames: Vec<IdentifierRename>,
    pub repairs: Vec<IntegrityEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct SubtreeWalk {
    /// Root first, then breadth-first in creation order.
    pub categories: Vec<Category>,
    pub anomalies: Vec<IntegrityEvent>,
}

impl SubtreeWalk {
    pub fn ids(&self) -> Vec<CategoryId> {
        self.categories.iter().map(|category| category.id).collect()
    }

    pub fn contains(&self, id: CategoryId) -> bool {
        self.categories.iter().any(|category| category.id == id)
    }
}

/// Upward walk from one category: ids immediate parent first, and what stopped
/// the walk early, if anything.
#[derive(Debug, Clone, Default)]
pub struct AncestorWalk {
    pub ids: Vec<CategoryId>,
    pub anomaly: Option<IntegrityEvent>,
}

pub struct CategoryTree<'a, S: Store> {
    store: &'a S,
    config: &'a EngineConfig,
    kinds: &'a ContentKindRegistry,
}

impl<'a, S: Store> CategoryTree<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig, kinds: &'a ContentKindRegistry) -> Self {
        Self { store, config, kinds }
    }

    pub fn category(&self, id: CategoryId) -> EngineResult<Category> {
        self.store
            .read_category(id)?
            .ok_or_else(|| EngineError::not_found("category", id))
    }

    fn require_scope(&self, id: ScopeId) -> EngineResult<()> {
        match self.store.read_scope(id)? {
            Some(_) => Ok(()),
            None => Err(EngineError::not_found("scope", id)),
        }
    }

    fn children_of(&self, category: &Category) -> EngineResult<Vec<Category>> {
        let mut children = self.store.list_child_categories(category.id)?;
        if category.is_top {
            children.extend(self.store.list_parentless_categories(category.scope_id)?);
            children.sort_by_key(|child| child.id);
        }
        Ok(children)
    }

    /// Follows child links from `root` regardless of scope, so corrupted
    /// descendants are still found. Terminates on cycles and at the depth cap.
    pub fn walk_subtree(&self, root: CategoryId) -> EngineResult<SubtreeWalk> {
        let root = self.category(root)?;
        let limit = self.config.max_category_depth;
        let mut walk = SubtreeWalk::default();
        let mut visited = HashSet::from([root.id]);
        let mut queue = VecDeque::from([(root.clone(), 0usize)]);
        if let Some(parent_id) = root.parent_id {
            if self.store.read_category(parent_id)?.is_none() {
                walk.anomalies.push(IntegrityEvent::MissingParentCategory {
                    category_id: root.id,
                    parent_id,
                });
            }
        }
        walk.categories.push(root);

        while let Some((current, depth)) = queue.pop_front() {
            let children = self.children_of(&current)?;
            if depth >= limit {
                if !children.is_empty() {
                    walk.anomalies.push(IntegrityEvent::CategoryDepthExceeded {
                        category_id: current.id,
                        limit,
                    });
                }
                continue;
            }
            for child in children {
                if !visited.insert(child.id) {
                    walk.anomalies.push(IntegrityEvent::CategoryCycle { category_id: child.id });
                    continue;
                }
                if child.scope_id != current.scope_id {
                    walk.anomalies.push(IntegrityEvent::CrossScopeParent {
                        category_id: child.id,
                        category_scope_id: child.scope_id,
                        parent_id: current.id,
                        parent_scope_id: current.scope_id,
                    });
                }
                walk.categories.push(child.clone());
                queue.push_back((child, depth + 1));
            }
        }

        Ok(walk)
    }

    pub fn list_subtree(&self, category_id: CategoryId) -> EngineResult<Vec<CategoryId>> {
        Ok(self.walk_subtree(category_id)?.ids())
    }

    pub fn list_ancestors(&self, category_id: CategoryId) -> EngineResult<Vec<CategoryId>> {
        Ok(self.walk_ancestors(category_id)?.ids)
    }

    /// Immediate parent first. Stops at a root, a dangling parent, a cycle, the
    /// depth cap, or a parent in a different scope than `category_id`; all but
    /// the first are reported as the walk's anomaly.
    pub fn walk_ancestors(&self, category_id: CategoryId) -> EngineResult<AncestorWalk> {
        let start = self.category(category_id)?;
        let limit = self.config.max_category_depth;
        let mut walk = AncestorWalk::default();
        let mut visited = HashSet::from([start.id]);
        let mut child = start.clone();

        while let Some(parent_id) = child.parent_id {
            if walk.ids.len() >= limit {
                walk.anomaly = Some(IntegrityEvent::CategoryDepthExceeded {
                    category_id: start.id,
                    limit,
                });
                break;
            }
            if !visited.insert(parent_id) {
                walk.anomaly = Some(IntegrityEvent::CategoryCycle { category_id: parent_id });
                break;
            }
            let Some(parent) = self.store.read_category(parent_id)? else {
                walk.anomaly = Some(IntegrityEvent::MissingParentCategory {
                    category_id: child.id,
                    parent_id,
                });
                break;
            };
            if parent.scope_id != start.scope_id {
                walk.anomaly = Some(IntegrityEvent::CrossScopeParent {
                    category_id: child.id,
                    category_scope_id: child.scope_id,
                    parent_id: parent.id,
                    parent_scope_id: parent.scope_id,
                });
                break;
            }
            walk.ids.push(parent.id);
            child = parent;
        }

        Ok(walk)
    }

    /// The scope's Top category, created on first use. Duplicate Tops left by
    /// earlier corruption are merged into the oldest one.
    pub fn ensure_top(&self, scope_id: ScopeId, changes: &mut TreeChanges) -> EngineResult<Category> {
        self.require_scope(scope_id)?;
        let mut tops = self.store.list_top_categories(scope_id)?.into_iter();
        let Some(kept) = tops.next() else {
            let top = self.store.insert_category(&NewCategory {
                scope_id,
                parent_id: None,
                name: self.config.top_category_name.clone(),
                is_top: true,
            })?;
            tracing::debug!(scope_id = %scope_id, category_id = %top.id, "created top category");
            changes.created.push(top.id);
            return Ok(top);
        };

        for duplicate in tops {
            changes.repairs.push(IntegrityEvent::DuplicateTopCategory {
                scope_id,
                kept: kept.id,
                duplicate: duplicate.id,
            });
            self.absorb_top(&duplicate, &kept, changes)?;
        }
        Ok(kept)
    }

    /// Moves the children and items of `absorbed` under `survivor`, then deletes it.
    fn absorb_top(&self, absorbed: &Category, survivor: &Category, changes: &mut TreeChanges) -> EngineResult<()> {
        for mut child in self.store.list_child_categories(absorbed.id)? {
            child.parent_id = Some(survivor.id);
            self.store.write_category(&child)?;
        }
        let items = self.store.list_items_in_category(absorbed.id)?;
        if !items.is_empty() {
            let mut taken = self.store.list_identifiers_in_category(survivor.id)?;
            for item in &items {
                self.transfer_item(item, survivor, &mut taken, changes)?;
                if absorbed.scope_id != survivor.scope_id {
                    changes.scope_changes.push(ScopeChange {
                        entry_id: item.entry_id,
                        old_scope_id: absorbed.scope_id,
                        new_scope_id: survivor.scope_id,
                    });
                }
            }
        }
        self.store.delete_category(absorbed.id)?;
        changes.deleted.push(absorbed.id);
        Ok(())
    }

    /// A `None` parent places the category directly under the scope's Top.
    pub fn create_category(
        &self,
        scope_id: ScopeId,
        parent_id: Option<CategoryId>,
        name: &str,
        changes: &mut TreeChanges,
    ) -> EngineResult<Category> {
        let parent = match parent_id {
            Some(id) => {
                let parent = self.category(id)?;
                if parent.scope_id != scope_id {
                    return Err(EngineError::InvalidStructure(format!(
                        "parent {} belongs to {}, not {}",
                        parent.id, parent.scope_id, scope_id
                    )));
                }
                parent
            }
            None => self.ensure_top(scope_id, changes)?,
        };
        let category = self.store.insert_category(&NewCategory {
            scope_id,
            parent_id: Some(parent.id),
            name: name.to_string(),
            is_top: false,
        })?;
        changes.created.push(category.id);
        Ok(category)
    }

    /// Moves an item's entry into `destination`, renaming its identifier when the
    /// destination already uses it. `taken` is kept current for batch moves.
    pub fn transfer_item(
        &self,
        item: &Item,
        destination: &Category,
        taken: &mut HashSet<String>,
        changes: &mut TreeChanges,
    ) -> EngineResult<()> {
        let mut identifier = item.identifier.clone();
        if let Some(current) = item.identifier.as_deref().filter(|value| !value.is_empty()) {
            if taken.contains(current) {
                let resolver = IdentifierResolver::new(self.store, self.config.identifier_suffix_fallback);
                let proposed = resolver.resolve_collision(current, taken);
                let adjusted = self.kinds.handler_for(&item.kind).adjust_identifier(item, proposed);
                identifier = match adjusted {
                    Some(value) if !value.is_empty() && taken.contains(&value) => {
                        resolver.resolve_collision(&value, taken)
                    }
                    other => other,
                };
            }
        }

        if item.category_id != destination.id {
            self.store.write_item_category(item.entry_id, destination.id)?;
        }
        if identifier != item.identifier {
            self.store.write_item_identifier(item.entry_id, identifier.as_deref())?;
            tracing::debug!(
                entry_id = %item.entry_id,
                from = ?item.identifier,
                to = ?identifier,
                "renamed identifier on collision"
            );
            changes.renames.push(IdentifierRename {
                entry_id: item.entry_id,
                from: item.identifier.clone(),
                to: identifier.clone(),
            });
        }
        if let Some(value) = identifier.filter(|value| !value.is_empty()) {
            taken.insert(value);
        }
        Ok(())
    }

    /// Moves the whole subtree of `category_id` into `new_scope_id`. Moved Top
    /// categories merge into the destination's Top; every item whose category scope
    /// changed is appended to `changes.scope_changes`.
    pub fn relocate(&self, category_id: CategoryId, new_scope_id: ScopeId, changes: &mut TreeChanges) -> EngineResult<()> {
        self.require_scope(new_scope_id)?;
        let walk = self.walk_subtree(category_id)?;
        changes.repairs.extend(walk.anomalies.iter().cloned());
        let root = walk.categories[0].clone();

        let mut outside_tops = self
            .store
            .list_top_categories(new_scope_id)?
            .into_iter()
            .filter(|top| !walk.contains(top.id));
        let mut destination_top = outside_tops.next();
        if let Some(kept) = destination_top.clone() {
            for duplicate in outside_tops {
                changes.repairs.push(IntegrityEvent::DuplicateTopCategory {
                    scope_id: new_scope_id,
                    kept: kept.id,
                    duplicate: duplicate.id,
                });
                self.absorb_top(&duplicate, &kept, changes)?;
            }
        }

        let mut merged: Vec<Category> = Vec::new();
        let mut records: Vec<Category> = Vec::with_capacity(walk.categories.len());
        for category in &walk.categories {
            if category.is_top {
                match destination_top.as_ref().map(|top| top.id) {
                    Some(top_id) if top_id != category.id => {
                        merged.push(category.clone());
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        let mut promoted = category.clone();
                        promoted.scope_id = new_scope_id;
                        promoted.parent_id = None;
                        destination_top = Some(promoted);
                    }
                }
            }
            records.push(category.clone());
        }

        let root_changes_scope = root.scope_id != new_scope_id;
        let needs_top = !merged.is_empty()
            || (!root.is_top && root_changes_scope)
            || records.iter().any(|record| !record.is_top && record.parent_id.is_none());
        let top_id = match &destination_top {
            Some(top) => Some(top.id),
            None if needs_top => Some(self.ensure_top(new_scope_id, changes)?.id),
            None => None,
        };
        let merged_ids: HashSet<CategoryId> = merged.iter().map(|top| top.id).collect();

        let mut old_scopes: HashMap<CategoryId, ScopeId> = HashMap::new();
        for mut record in records {
            old_scopes.insert(record.id, record.scope_id);
            record.scope_id = new_scope_id;
            if record.is_top {
                record.parent_id = None;
            } else if record.id == root.id && root_changes_scope {
                record.parent_id = top_id;
            } else if record.parent_id.is_none() || record.parent_id.is_some_and(|id| merged_ids.contains(&id)) {
                record.parent_id = top_id;
            }
            self.store.write_category(&record)?;
        }

        for (id, old_scope) in &old_scopes {
            if *old_scope == new_scope_id {
                continue;
            }
            for item in self.store.list_items_in_category(*id)? {
                changes.scope_changes.push(ScopeChange {
                    entry_id: item.entry_id,
                    old_scope_id: *old_scope,
                    new_scope_id,
                });
            }
        }

        if !merged.is_empty() {
            let survivor = match top_id {
                Some(id) => self.category(id)?,
                None => return Err(EngineError::Internal("destination top category vanished".to_string())),
            };
            for top in &merged {
                tracing::info!(
                    category_id = %top.id,
                    into = %survivor.id,
                    scope_id = %new_scope_id,
                    "merging moved top category into destination top"
                );
                self.absorb_top(top, &survivor, changes)?;
            }
        }

        // Stable ordering keeps reconciliation deterministic.
        changes.scope_changes.sort_by_key(|change| change.entry_id);
        changes.scope_changes.dedup_by_key(|change| change.entry_id);
        Ok(())
    }

    /// Re-parents every top-level category of `from_scope` into `to_scope`.
    pub fn relocate_scope(&self, from_scope: ScopeId, to_scope: ScopeId, changes: &mut TreeChanges) -> EngineResult<()> {
        self.require_scope(from_scope)?;
        self.require_scope(to_scope)?;
        let tops = self.store.list_top_categories(from_scope)?;
        if tops.is_empty() {
            for orphan in self.store.list_parentless_categories(from_scope)? {
                self.relocate(orphan.id, to_scope, changes)?;
            }
            return Ok(());
        }
        for top in tops {
            // A previous iteration may already have absorbed this one.
            if self.store.read_category(top.id)?.is_some() {
                self.relocate(top.id, to_scope, changes)?;
            }
        }
        Ok(())
    }

    /// Moves `category_id` under `new_parent_id`, relocating it first when the new
    /// parent lives in another scope. Rejected before any write when it would
    /// create a cycle.
    pub fn reparent(&self, category_id: CategoryId, new_parent_id: CategoryId, changes: &mut TreeChanges) -> EngineResult<()> {
        let category = self.category(category_id)?;
        if category.is_top {
            return Err(EngineError::InvalidStructure(format!(
                "top category {} cannot be moved under another category",
                category.id
            )));
        }
        let new_parent = self.category(new_parent_id)?;
        let walk = self.walk_subtree(category_id)?;
        if walk.contains(new_parent.id) {
            return Err(EngineError::InvalidStructure(format!(
                "cannot move {} into its own subtree ({})",
                category.id, new_parent.id
            )));
        }

        // `relocate` reports the walk's anomalies itself.
        if new_parent.scope_id != category.scope_id {
            self.relocate(category_id, new_parent.scope_id, changes)?;
        } else {
            changes.repairs.extend(walk.anomalies.iter().cloned());
        }
        let mut moved = self.category(category_id)?;
        moved.parent_id = Some(new_parent.id);
        self.store.write_category(&moved)?;
        Ok(())
    }

    /// Deletes the subtree of `category_id` after moving every item it owns into
    /// the rescue category. Items are never deleted.
    pub fn delete_safe(
        &self,
        category_id: CategoryId,
        rescue_category_id: Option<CategoryId>,
        changes: &mut TreeChanges,
    ) -> EngineResult<Option<CategoryId>> {
        let walk = self.walk_subtree(category_id)?;
        let category = walk.categories[0].clone();
        match rescue_category_id {
            Some(rescue_id) if walk.contains(rescue_id) => {
                return Err(EngineError::InvalidStructure(format!(
                    "rescue category {} is inside the deleted subtree of {}",
                    rescue_id, category.id
                )));
            }
            Some(rescue_id) => {
                self.category(rescue_id)?;
            }
            None if category.is_top => {
                return Err(EngineError::InvalidStructure(format!(
                    "top category {} can only be deleted with an explicit rescue category",
                    category.id
                )));
            }
            None => {}
        }
        changes.repairs.extend(walk.anomalies.iter().cloned());

        let mut items: Vec<(Item, ScopeId)> = Vec::new();
        for member in &walk.categories {
            for item in self.store.list_items_in_category(member.id)? {
                items.push((item, member.scope_id));
            }
        }

        let mut rescue_used = None;
        if !items.is_empty() {
            let rescue = match rescue_category_id {
                Some(id) => self.category(id)?,
                None => {
                    let top = self.ensure_top(category.scope_id, changes)?;
                    if walk.contains(top.id) {
                        return Err(EngineError::InvalidStructure(format!(
                            "top category of {} is inside the deleted subtree",
                            category.scope_id
                        )));
                    }
                    let name = self.config.rescue_name_for(&category.name);
                    self.create_category(category.scope_id, Some(top.id), &name, changes)?
                }
            };
            let mut taken = self.store.list_identifiers_in_category(rescue.id)?;
            for (item, old_scope) in &items {
                self.transfer_item(item, &rescue, &mut taken, changes)?;
                if *old_scope != rescue.scope_id {
                    changes.scope_changes.push(ScopeChange {
                        entry_id: item.entry_id,
                        old_scope_id: *old_scope,
                        new_scope_id: rescue.scope_id,
                    });
                }
            }
            tracing::info!(
                category_id = %category.id,
                rescue_id = %rescue.id,
                items = items.len(),
                "rescued items before deleting category"
            );
            rescue_used = Some(rescue.id);
        }

        for member in walk.categories.iter().rev() {
            self.store.delete_category(member.id)?;
            changes.deleted.push(member.id);
        }
        Ok(rescue_used)
    }
}
