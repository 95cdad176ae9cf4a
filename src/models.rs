use crate::integrity::IntegrityEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }
    };
}

id_type!(ScopeId, "scope");
id_type!(CategoryId, "category");
id_type!(EntryId, "entry");
id_type!(BindingId, "binding");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeKind {
    Global,
    Group,
    Course,
    Activity,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Group => "group",
            Self::Course => "course",
            Self::Activity => "activity",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "global" => Some(Self::Global),
            "group" => Some(Self::Group),
            "course" => Some(Self::Course),
            "activity" => Some(Self::Activity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    pub parent_id: Option<ScopeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: CategoryId,
    pub scope_id: ScopeId,
    pub parent_id: Option<CategoryId>,
    pub name: String,
    pub is_top: bool,
    pub sort_order: i64,
    pub modified_at: DateTime<Utc>,
}

/// Insert payload for a category; the store assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    pub scope_id: ScopeId,
    pub parent_id: Option<CategoryId>,
    pub name: String,
    pub is_top: bool,
}

/// The latest version of an entry, together with the entry-level fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub entry_id: EntryId,
    pub version: i64,
    pub category_id: CategoryId,
    pub identifier: Option<String>,
    pub kind: String,
}

impl Item {
    pub fn has_identifier(&self) -> bool {
        self.identifier.as_deref().is_some_and(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelBinding {
    pub id: BindingId,
    pub entry_id: EntryId,
    pub label: String,
    pub scope_id: ScopeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    MoveCategory,
    ReparentCategory,
    DeleteCategory,
    ChangeItemCategory,
    MoveItems,
    MoveScopeContent,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MoveCategory => "move-category",
            Self::ReparentCategory => "reparent-category",
            Self::DeleteCategory => "delete-category",
            Self::ChangeItemCategory => "change-item-category",
            Self::MoveItems => "move-items",
            Self::MoveScopeContent => "move-scope-content",
        }
    }
}

/// An item whose category scope changed during a structural edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeChange {
    pub entry_id: EntryId,
    pub old_scope_id: ScopeId,
    pub new_scope_id: ScopeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierRename {
    pub entry_id: EntryId,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub operation_id: Uuid,
    pub operation: OperationKind,
    pub affected_entries: Vec<EntryId>,
    pub identifier_renames: Vec<IdentifierRename>,
    pub bindings_rebound: usize,
    pub bindings_deleted: usize,
    pub bindings_merged: usize,
    pub categories_created: Vec<CategoryId>,
    pub categories_deleted: Vec<CategoryId>,
    pub repairs: Vec<IntegrityEvent>,
}

impl MigrationReport {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            operation,
            affected_entries: Vec::new(),
            identifier_renames: Vec::new(),
            bindings_rebound: 0,
            bindings_deleted: 0,
            bindings_merged: 0,
            categories_created: Vec::new(),
            categories_deleted: Vec::new(),
            repairs: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.affected_entries.is_empty()
            && self.identifier_renames.is_empty()
            && self.categories_created.is_empty()
            && self.categories_deleted.is_empty()
            && self.bindings_rebound == 0
            && self.bindings_deleted == 0
            && self.bindings_merged == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_kind_round_trips_through_text() {
        for kind in [ScopeKind::Global, ScopeKind::Group, ScopeKind::Course, ScopeKind::Activity] {
            assert_eq!(ScopeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ScopeKind::parse("coursecat"), None);
    }

    #[test]
    fn empty_identifier_is_not_an_identifier() {
        let mut item = Item {
            entry_id: EntryId(1),
            version: 1,
            category_id: CategoryId(1),
            identifier: Some(String::new()),
            kind: "shortanswer".to_string(),
        };
        assert!(!item.has_identifier());
        item.identifier = Some("q1".to_string());
        assert!(item.has_identifier());
    }

    #[test]
    fn report_serializes_with_camel_case_fields() {
        let report = MigrationReport::new(OperationKind::MoveCategory);
        let value = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(value["operation"], "move-category");
        assert!(value.get("affectedEntries").is_some());
        assert!(report.is_noop());
    }
}
