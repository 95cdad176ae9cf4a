use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const DEFAULT_MAX_SCOPE_DEPTH: usize = 64;
const DEFAULT_MAX_CATEGORY_DEPTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Hard cap on scope parent walks; deeper chains are treated as corrupt.
    pub max_scope_depth: usize,
    /// Hard cap on category parent/child walks.
    pub max_category_depth: usize,
    pub top_category_name: String,
    /// `{name}` is replaced with the name of the deleted category.
    pub rescue_category_name: String,
    /// When the numeric increment has no suggestion, append `_<n>` instead of clearing.
    pub identifier_suffix_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_scope_depth: DEFAULT_MAX_SCOPE_DEPTH,
            max_category_depth: DEFAULT_MAX_CATEGORY_DEPTH,
            top_category_name: "top".to_string(),
            rescue_category_name: "Rescued from {name}".to_string(),
            identifier_suffix_fallback: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> EngineResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `.json`, `.yaml` or `.yml` files; anything else is rejected.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml(&raw),
            _ => Err(EngineError::Config(format!(
                "unsupported config format: {}",
                path.to_string_lossy()
            ))),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_scope_depth == 0 {
            return Err(EngineError::Config("maxScopeDepth must be at least 1".to_string()));
        }
        if self.max_category_depth == 0 {
            return Err(EngineError::Config("maxCategoryDepth must be at least 1".to_string()));
        }
        if self.top_category_name.trim().is_empty() {
            return Err(EngineError::Config("topCategoryName must not be empty".to_string()));
        }
        if self.rescue_category_name.trim().is_empty() {
            return Err(EngineError::Config("rescueCategoryName must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn rescue_name_for(&self, deleted_name: &str) -> String {
        self.rescue_category_name.replace("{name}", deleted_name)
    }
}
