//! Persistence collaborator contract.
//!
//! The engine only ever talks to storage through [`Store`]. Reads must tolerate
//! corrupted rows (cross-scope parents, dangling ids); writes are single-row and
//! the caller groups them with [`Store::run_in_transaction`].

mod sqlite;

pub use sqlite::SqliteStore;

use crate::errors::EngineResult;
use crate::models::{
    BindingId, Category, CategoryId, EntryId, Item, LabelBinding, NewCategory, Scope, ScopeId,
};
use std::collections::HashSet;

pub trait Store {
    fn read_scope(&self, id: ScopeId) -> EngineResult<Option<Scope>>;

    fn read_category(&self, id: CategoryId) -> EngineResult<Option<Category>>;

    /// Categories whose `parent_id` is `parent_id`, in creation order.
    fn list_child_categories(&self, parent_id: CategoryId) -> EngineResult<Vec<Category>>;

    /// Non-top categories of a scope with no parent at all, in creation order.
    fn list_parentless_categories(&self, scope_id: ScopeId) -> EngineResult<Vec<Category>>;

    fn list_top_categories(&self, scope_id: ScopeId) -> EngineResult<Vec<Category>>;

    fn read_item(&self, entry_id: EntryId) -> EngineResult<Option<Item>>;

    fn list_items_in_category(&self, category_id: CategoryId) -> EngineResult<Vec<Item>>;

    /// Non-empty identifiers currently used in a category.
    fn list_identifiers_in_category(&self, category_id: CategoryId) -> EngineResult<HashSet<String>>;

    fn list_bindings_for_item(&self, entry_id: EntryId) -> EngineResult<Vec<LabelBinding>>;

    fn is_latest(&self, version: i64, entry_id: EntryId) -> EngineResult<bool>;

    fn insert_category(&self, category: &NewCategory) -> EngineResult<Category>;

    fn write_category(&self, category: &Category) -> EngineResult<()>;

    fn delete_category(&self, id: CategoryId) -> EngineResult<()>;

    fn write_item_category(&self, entry_id: EntryId, category_id: CategoryId) -> EngineResult<()>;

    fn write_item_identifier(&self, entry_id: EntryId, identifier: Option<&str>) -> EngineResult<()>;

    fn write_binding(&self, binding: &LabelBinding) -> EngineResult<()>;

    fn delete_binding(&self, id: BindingId) -> EngineResult<()>;

    /// Runs `f` all-or-nothing. Nested calls must be supported.
    fn run_in_transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> EngineResult<T>;
}
