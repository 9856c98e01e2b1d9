//! Per-project configuration (`.rapturelintrc`).
//!
//! ```json
//! {
//!   "sessions": [
//!     { "id": "A", "rules": [ { "pattern": "**/*.json", "rule": "json" } ] }
//!   ]
//! }
//! ```
//!
//! Rule references are resolved through a [`RuleResolver`] at parse time, so
//! a [`Configuration`] only ever holds loaded rules. Values are immutable: a
//! changed file produces a new configuration.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::engine::{Rule, RuleResolver};
use crate::error::ConfigError;
use crate::watcher::RootedPattern;

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    sessions: Vec<RawSession>,
}

#[derive(Debug, Deserialize)]
struct RawSession {
    id: String,
    /// Default rule for entries that name none.
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    id: Option<String>,
    pattern: String,
    #[serde(default, alias = "rapture")]
    rule: Option<Value>,
}

/// Parsed and resolved project configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    sessions: Vec<SessionDeclaration>,
}

/// One declared validation session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDeclaration {
    pub id: String,
    pub rules: Vec<RuleDeclaration>,
}

/// One file-matching rule of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDeclaration {
    pub id: Option<String>,
    /// Pattern relative to the project root, as declared.
    pub pattern: String,
    pub rule: Rule,
}

/// Rule references may be written as strings or bare numbers.
fn reference_text(value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ConfigError::Resolve {
            reference: other.to_string(),
            reason: "rule references must be strings or numbers".to_string(),
        }),
    }
}

impl Configuration {
    /// Parse configuration text read from `source` and resolve its rules.
    pub fn parse(
        text: &str,
        source: &Path,
        project_root: &Path,
        resolver: &dyn RuleResolver,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfiguration =
            serde_json::from_str(text).map_err(|source_err| ConfigError::Parse {
                path: source.to_path_buf(),
                source: source_err,
            })?;

        let mut sessions = Vec::with_capacity(raw.sessions.len());
        for session in raw.sessions {
            let context = match &session.context {
                Some(value) => Some(resolver.resolve(&reference_text(value)?, project_root)?),
                None => None,
            };

            let mut rules = Vec::with_capacity(session.rules.len());
            for rule in session.rules {
                // Reject patterns up front so a bad one never reaches a watcher
                RootedPattern::new(project_root, &rule.pattern)?;

                let resolved = match &rule.rule {
                    Some(value) => resolver.resolve(&reference_text(value)?, project_root)?,
                    None => context.clone().ok_or_else(|| ConfigError::MissingRule {
                        session: session.id.clone(),
                        pattern: rule.pattern.clone(),
                    })?,
                };

                rules.push(RuleDeclaration {
                    id: rule.id,
                    pattern: rule.pattern,
                    rule: resolved,
                });
            }

            sessions.push(SessionDeclaration {
                id: session.id,
                rules,
            });
        }

        Ok(Self { sessions })
    }

    /// Read and parse the configuration file at `path`.
    pub async fn load(
        path: &Path,
        project_root: &Path,
        resolver: &dyn RuleResolver,
    ) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text, path, project_root, resolver)
    }

    pub fn sessions(&self) -> &[SessionDeclaration] {
        &self.sessions
    }

    /// Total number of rule declarations across sessions.
    pub fn rule_count(&self) -> usize {
        self.sessions.iter().map(|s| s.rules.len()).sum()
    }
}
