//! Seam to the rule-evaluation engine.
//!
//! The orchestrator never evaluates rules itself. It drives an engine through
//! the traits below:
//!
//! ```text
//! RuleEngine ──create_session──> Session ──create_artifact_context──> ArtifactContext
//!                                                                        │
//!                                         ContextObserver <──issues/disposed
//! ```
//!
//! Artifact contexts are addressed by absolute path inside their session, so
//! callers hold paths rather than references into the engine.

pub mod json;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EngineError};

/// A loaded rule definition, tagged with the logical id it was resolved from.
///
/// The definition itself is opaque to the orchestrator; engines downcast it
/// back to their own rule type.
#[derive(Clone)]
pub struct Rule {
    id: String,
    definition: Arc<dyn Any + Send + Sync>,
}

impl Rule {
    pub fn new<T: Any + Send + Sync>(id: impl Into<String>, definition: T) -> Self {
        Self {
            id: id.into(),
            definition: Arc::new(definition),
        }
    }

    /// Logical identifier the rule was registered under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Borrow the definition as the engine's concrete rule type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.definition.downcast_ref::<T>()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("id", &self.id).finish_non_exhaustive()
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.definition, &other.definition)
    }
}

/// Maps rule references found in configuration to loaded rules.
///
/// Resolution happens once per configuration parse, never while files are
/// being validated.
pub trait RuleResolver: Send + Sync {
    fn resolve(&self, reference: &str, project_root: &Path) -> Result<Rule, ConfigError>;
}

/// Explicit rule registry.
///
/// References are looked up by logical id first. References written as
/// relative paths (`./rules/a.json`) are joined onto the project root and
/// looked up among the registered assets.
#[derive(Debug, Default, Clone)]
pub struct RuleRegistry {
    rules: HashMap<String, Rule>,
    assets: HashMap<PathBuf, Rule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule under its own id.
    pub fn register(mut self, rule: Rule) -> Self {
        self.rules.insert(rule.id().to_string(), rule);
        self
    }

    /// Register a rule reachable through an absolute asset path.
    pub fn register_asset(mut self, path: impl Into<PathBuf>, rule: Rule) -> Self {
        self.assets.insert(path.into(), rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len() + self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RuleResolver for RuleRegistry {
    fn resolve(&self, reference: &str, project_root: &Path) -> Result<Rule, ConfigError> {
        if let Some(rule) = self.rules.get(reference) {
            return Ok(rule.clone());
        }

        if reference.starts_with("./") || reference.starts_with("../") {
            let asset = project_root.join(reference);
            let normalized: PathBuf = asset.components().collect();
            if let Some(rule) = self.assets.get(&normalized) {
                return Ok(rule.clone());
            }
            return Err(ConfigError::Resolve {
                reference: reference.to_string(),
                reason: format!("no rule registered at {}", normalized.display()),
            });
        }

        Err(ConfigError::Resolve {
            reference: reference.to_string(),
            reason: "no rule registered under this id".to_string(),
        })
    }
}

/// Issue severity as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Zero-based span of an issue inside its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IssueLocation {
    pub row_start: u32,
    pub col_start: u32,
    pub row_end: u32,
    pub col_end: u32,
}

/// A single finding produced by the engine for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub location: IssueLocation,
    /// Engine-defined category (`type` on the wire).
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Receives lifecycle notifications for one artifact context.
///
/// Engines hold the observer only while the context is alive and drop it on
/// dispose, so no notification can arrive for a disposed context.
pub trait ContextObserver: Send + Sync {
    /// Issues for `path` changed after creation.
    fn issues_changed(&self, path: &Path, issues: &[Issue]);

    /// The context for `path` was disposed.
    fn disposed(&self, path: &Path);
}

/// One file's validation state inside a session.
pub trait ArtifactContext: Send {
    /// Absolute path identifying this context.
    fn id(&self) -> &Path;

    fn rule(&self) -> &Rule;

    /// Replace the content. `None` marks content as unreliable.
    fn update(&mut self, content: Option<&str>);

    fn issues(&self) -> Vec<Issue>;
}

/// A validation scope grouping artifact contexts under one rule set.
pub trait Session: Send {
    /// Identifier from the declaring configuration.
    fn id(&self) -> &str;

    /// Create the context for `path`. Fails if one already exists.
    fn create_artifact_context(
        &mut self,
        path: &Path,
        rule: &Rule,
        content: Option<&str>,
        observer: Arc<dyn ContextObserver>,
    ) -> Result<(), EngineError>;

    fn artifact_context(&self, path: &Path) -> Option<&dyn ArtifactContext>;

    fn artifact_context_mut(&mut self, path: &Path) -> Option<&mut dyn ArtifactContext>;

    /// Move a context to a new path, keeping its engine state.
    fn update_context_id(&mut self, old: &Path, new: &Path) -> Result<(), EngineError>;

    /// Dispose the context for `path`, returning whether one existed.
    fn dispose_artifact_context(&mut self, path: &Path) -> bool;

    /// Dispose every remaining context (notifying their observers) and the
    /// session itself. Idempotent.
    fn dispose(&mut self);

    fn context_count(&self) -> usize;
}

/// Factory for sessions.
pub trait RuleEngine: Send + Sync {
    fn create_session(&self, id: &str) -> Box<dyn Session>;
}
