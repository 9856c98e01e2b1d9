//! Bundled JSON syntax engine.
//!
//! A small but complete [`RuleEngine`] used by tests and by hosts that only
//! need well-formedness checks. Two rules are provided, see [`json_rules`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    ArtifactContext, ContextObserver, Issue, IssueLocation, Rule, RuleEngine, RuleRegistry,
    Session, Severity,
};
use crate::error::EngineError;

/// Rule definitions understood by [`JsonEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRule {
    /// Content must parse as JSON.
    Syntax,
    /// Content must parse as a JSON object.
    Object,
}

/// Registry with `json` and `json-object` rules.
pub fn json_rules() -> RuleRegistry {
    RuleRegistry::new()
        .register(Rule::new("json", JsonRule::Syntax))
        .register(Rule::new("json-object", JsonRule::Object))
}

/// Engine producing [`JsonSession`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEngine;

impl JsonEngine {
    pub fn new() -> Self {
        Self
    }
}

impl RuleEngine for JsonEngine {
    fn create_session(&self, id: &str) -> Box<dyn Session> {
        Box::new(JsonSession::new(id))
    }
}

fn evaluate(rule: JsonRule, content: Option<&str>) -> Vec<Issue> {
    let Some(text) = content else {
        return vec![Issue {
            severity: Severity::Error,
            location: IssueLocation::default(),
            kind: "io".to_string(),
            message: "content could not be read".to_string(),
        }];
    };

    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            if rule == JsonRule::Object && !value.is_object() {
                vec![Issue {
                    severity: Severity::Error,
                    location: IssueLocation {
                        row_start: 0,
                        col_start: 0,
                        row_end: 0,
                        col_end: 1,
                    },
                    kind: "schema".to_string(),
                    message: "expected a top-level object".to_string(),
                }]
            } else {
                Vec::new()
            }
        }
        Err(e) => {
            // serde_json reports 1-based positions, column 0 at end of input
            let row = u32::try_from(e.line().saturating_sub(1)).unwrap_or(u32::MAX);
            let col = u32::try_from(e.column().saturating_sub(1)).unwrap_or(u32::MAX);
            vec![Issue {
                severity: Severity::Error,
                location: IssueLocation {
                    row_start: row,
                    col_start: col,
                    row_end: row,
                    col_end: col.saturating_add(1),
                },
                kind: "syntax".to_string(),
                message: e.to_string(),
            }]
        }
    }
}

struct JsonArtifact {
    id: PathBuf,
    rule: Rule,
    kind: JsonRule,
    issues: Vec<Issue>,
    observer: Arc<dyn ContextObserver>,
}

impl ArtifactContext for JsonArtifact {
    fn id(&self) -> &Path {
        &self.id
    }

    fn rule(&self) -> &Rule {
        &self.rule
    }

    fn update(&mut self, content: Option<&str>) {
        let issues = evaluate(self.kind, content);
        if issues != self.issues {
            self.issues = issues;
            self.observer.issues_changed(&self.id, &self.issues);
        }
    }

    fn issues(&self) -> Vec<Issue> {
        self.issues.clone()
    }
}

/// Session of the bundled JSON engine.
pub struct JsonSession {
    id: String,
    contexts: BTreeMap<PathBuf, JsonArtifact>,
    disposed: bool,
}

impl JsonSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            contexts: BTreeMap::new(),
            disposed: false,
        }
    }
}

impl Session for JsonSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_artifact_context(
        &mut self,
        path: &Path,
        rule: &Rule,
        content: Option<&str>,
        observer: Arc<dyn ContextObserver>,
    ) -> Result<(), EngineError> {
        if self.disposed {
            return Err(EngineError::Rejected {
                reason: format!("session '{}' is disposed", self.id),
            });
        }
        if self.contexts.contains_key(path) {
            return Err(EngineError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        let kind = *rule
            .downcast_ref::<JsonRule>()
            .ok_or_else(|| EngineError::ForeignRule {
                rule: rule.id().to_string(),
            })?;

        self.contexts.insert(
            path.to_path_buf(),
            JsonArtifact {
                id: path.to_path_buf(),
                rule: rule.clone(),
                kind,
                issues: evaluate(kind, content),
                observer,
            },
        );
        Ok(())
    }

    fn artifact_context(&self, path: &Path) -> Option<&dyn ArtifactContext> {
        self.contexts
            .get(path)
            .map(|ctx| ctx as &dyn ArtifactContext)
    }

    fn artifact_context_mut(&mut self, path: &Path) -> Option<&mut dyn ArtifactContext> {
        self.contexts
            .get_mut(path)
            .map(|ctx| ctx as &mut dyn ArtifactContext)
    }

    fn update_context_id(&mut self, old: &Path, new: &Path) -> Result<(), EngineError> {
        if self.contexts.contains_key(new) {
            return Err(EngineError::AlreadyExists {
                path: new.to_path_buf(),
            });
        }
        let mut ctx = self
            .contexts
            .remove(old)
            .ok_or_else(|| EngineError::UnknownContext {
                path: old.to_path_buf(),
            })?;
        ctx.id = new.to_path_buf();
        self.contexts.insert(new.to_path_buf(), ctx);
        Ok(())
    }

    fn dispose_artifact_context(&mut self, path: &Path) -> bool {
        match self.contexts.remove(path) {
            Some(ctx) => {
                ctx.observer.disposed(&ctx.id);
                true
            }
            None => false,
        }
    }

    fn dispose(&mut self) {
        for (_, ctx) in std::mem::take(&mut self.contexts) {
            ctx.observer.disposed(&ctx.id);
        }
        self.disposed = true;
    }

    fn context_count(&self) -> usize {
        self.contexts.len()
    }
}
