use super::Store;
use crate::errors::{EngineError, EngineResult};
use crate::models::{
    BindingId, Category, CategoryId, EntryId, Item, LabelBinding, NewCategory, Scope, ScopeId, ScopeKind,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const CATEGORY_COLUMNS: &str = "id, scope_id, parent_id, name, is_top, sort_order, modified_at";

const ITEM_SELECT: &str = "SELECT e.id,
        COALESCE((SELECT MAX(v.version) FROM versions v WHERE v.entry_id = e.id), 0),
        e.category_id, e.identifier, e.kind
   FROM entries e";

/// Which thread holds the open transaction, and how deeply it has nested.
#[derive(Debug, Default)]
struct TransactionOwner {
    thread: Option<ThreadId>,
    depth: usize,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    owner: Mutex<TransactionOwner>,
    turn_released: Condvar,
}

/// Held for the lifetime of one `run_in_transaction` level.
struct TransactionTurn<'a> {
    store: &'a SqliteStore,
    depth: usize,
}

impl Drop for TransactionTurn<'_> {
    fn drop(&mut self) {
        let mut owner = self
            .store
            .owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            self.store.turn_released.notify_all();
        }
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| EngineError::Storage(err.to_string()))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            owner: Mutex::new(TransactionOwner::default()),
            turn_released: Condvar::new(),
        })
    }

    /// Blocks while another thread has a transaction open on the shared connection.
    fn wait_for_turn(&self) -> EngineResult<MutexGuard<'_, TransactionOwner>> {
        let current = thread::current().id();
        let mut owner = self
            .owner
            .lock()
            .map_err(|_| EngineError::Internal("transaction owner mutex poisoned".to_string()))?;
        while owner.thread.is_some_and(|thread| thread != current) {
            owner = self
                .turn_released
                .wait(owner)
                .map_err(|_| EngineError::Internal("transaction owner mutex poisoned".to_string()))?;
        }
        Ok(owner)
    }

    fn begin_turn(&self) -> EngineResult<TransactionTurn<'_>> {
        let mut owner = self.wait_for_turn()?;
        owner.thread = Some(thread::current().id());
        owner.depth += 1;
        Ok(TransactionTurn {
            store: self,
            depth: owner.depth - 1,
        })
    }

    // The owner lock is held until the connection is taken so no other thread can
    // open a transaction in between.
    fn conn(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        let turn = self.wait_for_turn()?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("database mutex poisoned".to_string()))?;
        drop(turn);
        Ok(conn)
    }

    fn execute_batch(&self, sql: &str) -> EngineResult<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn insert_scope(&self, kind: ScopeKind, parent_id: Option<ScopeId>) -> EngineResult<Scope> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scopes (kind, parent_id) VALUES (?1, ?2)",
            params![kind.as_str(), parent_id.map(|id| id.0)],
        )?;
        Ok(Scope {
            id: ScopeId(conn.last_insert_rowid()),
            kind,
            parent_id,
        })
    }

    /// Scopes belong to the surrounding application; this exists so it (and tests)
    /// can model re-parented or corrupted scope trees.
    pub fn set_scope_parent(&self, scope_id: ScopeId, parent_id: Option<ScopeId>) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE scopes SET parent_id = ?1 WHERE id = ?2",
            params![parent_id.map(|id| id.0), scope_id.0],
        )?;
        Ok(())
    }

    /// Creates an entry at version 1.
    pub fn insert_item(&self, category_id: CategoryId, identifier: Option<&str>, kind: &str) -> EngineResult<Item> {
        let mut conn = self.conn()?;
        // A savepoint also nests inside an open `run_in_transaction`.
        let tx = conn.savepoint()?;
        tx.execute(
            "INSERT INTO entries (category_id, identifier, kind) VALUES (?1, ?2, ?3)",
            params![category_id.0, identifier, kind],
        )?;
        let entry_id = EntryId(tx.last_insert_rowid());
        tx.execute(
            "INSERT INTO versions (entry_id, version, created_at) VALUES (?1, 1, ?2)",
            params![entry_id.0, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(Item {
            entry_id,
            version: 1,
            category_id,
            identifier: identifier.map(ToString::to_string),
            kind: kind.to_string(),
        })
    }

    pub fn add_item_version(&self, entry_id: EntryId) -> EngineResult<i64> {
        let conn = self.conn()?;
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM versions WHERE entry_id = ?1",
            [entry_id.0],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO versions (entry_id, version, created_at) VALUES (?1, ?2, ?3)",
            params![entry_id.0, next, Utc::now().to_rfc3339()],
        )?;
        Ok(next)
    }

    pub fn insert_binding(&self, entry_id: EntryId, label: &str, scope_id: ScopeId) -> EngineResult<LabelBinding> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO label_bindings (entry_id, label, scope_id) VALUES (?1, ?2, ?3)",
            params![entry_id.0, label, scope_id.0],
        )?;
        Ok(LabelBinding {
            id: BindingId(conn.last_insert_rowid()),
            entry_id,
            label: label.to_string(),
            scope_id,
        })
    }

    pub fn count_categories(&self, scope_id: ScopeId) -> EngineResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM categories WHERE scope_id = ?1",
            [scope_id.0],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn query_categories(&self, sql: &str, param: i64) -> EngineResult<Vec<Category>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([param], parse_category_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Store for SqliteStore {
    fn read_scope(&self, id: ScopeId) -> EngineResult<Option<Scope>> {
        let conn = self.conn()?;
        let scope = conn
            .query_row(
                "SELECT id, kind, parent_id FROM scopes WHERE id = ?1",
                [id.0],
                parse_scope_row,
            )
            .optional()?;
        Ok(scope)
    }

    fn read_category(&self, id: CategoryId) -> EngineResult<Option<Category>> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
                [id.0],
                parse_category_row,
            )
            .optional()?;
        Ok(category)
    }

    fn list_child_categories(&self, parent_id: CategoryId) -> EngineResult<Vec<Category>> {
        self.query_categories(
            &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE parent_id = ?1 ORDER BY id ASC"),
            parent_id.0,
        )
    }

    fn list_parentless_categories(&self, scope_id: ScopeId) -> EngineResult<Vec<Category>> {
        self.query_categories(
            &format!(
                "SELECT {CATEGORY_COLUMNS} FROM categories
                 WHERE scope_id = ?1 AND parent_id IS NULL AND is_top = 0
                 ORDER BY id ASC"
            ),
            scope_id.0,
        )
    }

    fn list_top_categories(&self, scope_id: ScopeId) -> EngineResult<Vec<Category>> {
        self.query_categories(
            &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE scope_id = ?1 AND is_top = 1 ORDER BY id ASC"),
            scope_id.0,
        )
    }

    fn read_item(&self, entry_id: EntryId) -> EngineResult<Option<Item>> {
        let conn = self.conn()?;
        let item = conn
            .query_row(&format!("{ITEM_SELECT} WHERE e.id = ?1"), [entry_id.0], parse_item_row)
            .optional()?;
        Ok(item)
    }

    fn list_items_in_category(&self, category_id: CategoryId) -> EngineResult<Vec<Item>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{ITEM_SELECT} WHERE e.category_id = ?1 ORDER BY e.id ASC"))?;
        let items = stmt
            .query_map([category_id.0], parse_item_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn list_identifiers_in_category(&self, category_id: CategoryId) -> EngineResult<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT identifier FROM entries
             WHERE category_id = ?1 AND identifier IS NOT NULL AND identifier <> ''",
        )?;
        let identifiers = stmt
            .query_map([category_id.0], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(identifiers)
    }

    fn list_bindings_for_item(&self, entry_id: EntryId) -> EngineResult<Vec<LabelBinding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entry_id, label, scope_id FROM label_bindings WHERE entry_id = ?1 ORDER BY id ASC",
        )?;
        let bindings = stmt
            .query_map([entry_id.0], |row| {
                Ok(LabelBinding {
                    id: BindingId(row.get(0)?),
                    entry_id: EntryId(row.get(1)?),
                    label: row.get(2)?,
                    scope_id: ScopeId(row.get(3)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }

    fn is_latest(&self, version: i64, entry_id: EntryId) -> EngineResult<bool> {
        let conn = self.conn()?;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM versions WHERE entry_id = ?1",
            [entry_id.0],
            |row| row.get(0),
        )?;
        Ok(latest == Some(version))
    }

    fn insert_category(&self, category: &NewCategory) -> EngineResult<Category> {
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO categories (scope_id, parent_id, name, is_top, sort_order, modified_at)
             VALUES (?1, ?2, ?3, ?4, 999, ?5)",
            params![
                category.scope_id.0,
                category.parent_id.map(|id| id.0),
                category.name,
                category.is_top,
                now.to_rfc3339()
            ],
        )?;
        Ok(Category {
            id: CategoryId(conn.last_insert_rowid()),
            scope_id: category.scope_id,
            parent_id: category.parent_id,
            name: category.name.clone(),
            is_top: category.is_top,
            sort_order: 999,
            modified_at: now,
        })
    }

    fn write_category(&self, category: &Category) -> EngineResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE categories
             SET scope_id = ?1, parent_id = ?2, name = ?3, is_top = ?4, sort_order = ?5, modified_at = ?6
             WHERE id = ?7",
            params![
                category.scope_id.0,
                category.parent_id.map(|id| id.0),
                category.name,
                category.is_top,
                category.sort_order,
                Utc::now().to_rfc3339(),
                category.id.0
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("category", category.id));
        }
        Ok(())
    }

    fn delete_category(&self, id: CategoryId) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM categories WHERE id = ?1", [id.0])?;
        Ok(())
    }

    fn write_item_category(&self, entry_id: EntryId, category_id: CategoryId) -> EngineResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET category_id = ?1 WHERE id = ?2",
            params![category_id.0, entry_id.0],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("entry", entry_id));
        }
        Ok(())
    }

    fn write_item_identifier(&self, entry_id: EntryId, identifier: Option<&str>) -> EngineResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET identifier = ?1 WHERE id = ?2",
            params![identifier, entry_id.0],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("entry", entry_id));
        }
        Ok(())
    }

    fn write_binding(&self, binding: &LabelBinding) -> EngineResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE label_bindings SET entry_id = ?1, label = ?2, scope_id = ?3 WHERE id = ?4",
            params![binding.entry_id.0, binding.label, binding.scope_id.0, binding.id.0],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("binding", binding.id));
        }
        Ok(())
    }

    fn delete_binding(&self, id: BindingId) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM label_bindings WHERE id = ?1", [id.0])?;
        Ok(())
    }

    fn run_in_transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> EngineResult<T>,
    {
        // Savepoints nest, and the outermost one opens the real transaction. Only
        // the owning thread may nest; others wait until the outermost level ends.
        let turn = self.begin_turn()?;
        let savepoint = format!("reconcile_{}", turn.depth);
        self.execute_batch(&format!("SAVEPOINT {savepoint}"))?;

        let result = f();
        let finished = match &result {
            Ok(_) => self.execute_batch(&format!("RELEASE SAVEPOINT {savepoint}")),
            Err(_) => self.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {savepoint}; RELEASE SAVEPOINT {savepoint}"
            )),
        };

        let outcome = match (result, finished) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => {
                if let Err(rollback_error) = self.execute_batch(&format!(
                    "ROLLBACK TO SAVEPOINT {savepoint}; RELEASE SAVEPOINT {savepoint}"
                )) {
                    tracing::error!(error = %rollback_error, "rollback after failed release also failed");
                }
                Err(error)
            }
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(rollback_error)) => {
                tracing::error!(error = %rollback_error, "failed to roll back savepoint");
                Err(error)
            }
        };
        drop(turn);
        outcome
    }
}

fn parse_scope_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Scope> {
    Ok(Scope {
        id: ScopeId(row.get(0)?),
        kind: parse_scope_kind(&row.get::<_, String>(1)?)?,
        parent_id: row.get::<_, Option<i64>>(2)?.map(ScopeId),
    })
}

fn parse_category_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: CategoryId(row.get(0)?),
        scope_id: ScopeId(row.get(1)?),
        parent_id: row.get::<_, Option<i64>>(2)?.map(CategoryId),
        name: row.get(3)?,
        is_top: row.get::<_, i32>(4)? != 0,
        sort_order: row.get(5)?,
        modified_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

fn parse_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        entry_id: EntryId(row.get(0)?),
        version: row.get(1)?,
        category_id: CategoryId(row.get(2)?),
        identifier: row.get(3)?,
        kind: row.get(4)?,
    })
}

fn parse_scope_kind(raw: &str) -> rusqlite::Result<ScopeKind> {
    ScopeKind::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown scope kind '{}'", raw),
            )),
        )
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
