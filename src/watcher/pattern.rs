//! Glob patterns anchored at a project root.

use std::fmt;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::error::ConfigError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A glob pattern resolved against a root directory.
///
/// `*` never crosses a path separator, `**` spans directories, and the root
/// itself is matched literally even if it contains glob metacharacters.
#[derive(Clone)]
pub struct RootedPattern {
    root: PathBuf,
    declared: String,
    compiled: Pattern,
}

impl RootedPattern {
    pub fn new(root: &Path, pattern: &str) -> Result<Self, ConfigError> {
        if pattern.trim().is_empty() {
            return Err(ConfigError::Pattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        let anchored = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            let escaped = Pattern::escape(&root.to_string_lossy());
            Path::new(&escaped)
                .join(normalize_relative(pattern)?)
                .to_string_lossy()
                .into_owned()
        };

        let compiled = Pattern::new(&anchored).map_err(|e| ConfigError::Pattern {
            pattern: pattern.to_string(),
            reason: e.msg.to_string(),
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            declared: pattern.to_string(),
            compiled,
        })
    }

    /// Whether `path` (absolute, or relative to the root) matches.
    pub fn matches(&self, path: &Path) -> bool {
        if path.is_absolute() {
            self.compiled.matches_path_with(path, MATCH_OPTIONS)
        } else {
            self.compiled
                .matches_path_with(&self.root.join(path), MATCH_OPTIONS)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The pattern as written in configuration.
    pub fn declared(&self) -> &str {
        &self.declared
    }

    /// The absolute pattern actually matched against.
    pub fn as_str(&self) -> &str {
        self.compiled.as_str()
    }
}

/// Drop `.` and empty segments. `..` would leave the watched root.
fn normalize_relative(pattern: &str) -> Result<String, ConfigError> {
    let mut segments = Vec::new();
    for segment in pattern.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(ConfigError::Pattern {
                    pattern: pattern.to_string(),
                    reason: "patterns cannot leave the project root".to_string(),
                });
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(ConfigError::Pattern {
            pattern: pattern.to_string(),
            reason: "pattern names no files".to_string(),
        });
    }
    Ok(segments.join("/"))
}

impl fmt::Debug for RootedPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootedPattern")
            .field("root", &self.root)
            .field("pattern", &self.declared)
            .finish()
    }
}

impl PartialEq for RootedPattern {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.declared == other.declared
    }
}
