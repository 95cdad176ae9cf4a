//! Keeps per-scope category trees, item identifiers and label bindings
//! consistent while categories and items move between visibility scopes.

pub mod category_tree;
pub mod config;
pub mod content_kind;
pub mod errors;
pub mod identifier;
pub mod integrity;
pub mod labels;
pub mod models;
pub mod orchestrator;
pub mod scope_tree;
pub mod store;
pub mod telemetry;

pub use crate::config::EngineConfig;
pub use crate::content_kind::{ContentKindHandler, ContentKindRegistry, StandardKind};
pub use crate::errors::{EngineError, EngineResult};
pub use crate::integrity::{IntegrityEvent, IntegrityObserver, RecordingObserver, TracingObserver};
pub use crate::models::{
    BindingId, Category, CategoryId, EntryId, IdentifierRename, Item, LabelBinding, MigrationReport, NewCategory,
    OperationKind, Scope, ScopeChange, ScopeId, ScopeKind,
};
pub use crate::orchestrator::Orchestrator;
pub use crate::store::{SqliteStore, Store};
pub use crate::telemetry::init_tracing;
