//! File-type mapping rules.
//!
//! A [`MappingRule`] sends files whose extension matches its pattern to a
//! target directory. Rules are plain values supplied per call; nothing here
//! holds global state.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct MappingRule {
    pattern: String,
    target_dir: PathBuf,
    priority: i32,
    matcher: GlobMatcher,
}

impl MappingRule {
    /// Build a rule from a raw pattern (`*.jpg`, `.jpg`, `jpg` or the
    /// catch-all `*`).
    pub fn new(pattern: &str, target_dir: impl Into<PathBuf>, priority: i32) -> Result<Self> {
        let pattern = normalize_pattern(pattern)?;
        let matcher = compile(&pattern)?.compile_matcher();
        Ok(MappingRule {
            pattern,
            target_dir: target_dir.into(),
            priority,
            matcher,
        })
    }

    /// Normalized pattern, always of the form `*.ext` or `*`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.matcher.is_match(name))
            .unwrap_or(false)
    }
}

impl PartialEq for MappingRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.target_dir == other.target_dir
            && self.priority == other.priority
    }
}

/// Normalize `*.ext`, `.ext` and `ext` to `*.ext` (lowercased).
pub fn normalize_pattern(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let reject = |reason: &str| EngineError::InvalidRule {
        pattern: raw.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(reject("pattern is empty"));
    }
    if trimmed == "*" {
        return Ok("*".to_string());
    }

    let ext = trimmed
        .strip_prefix("*.")
        .or_else(|| trimmed.strip_prefix('.'))
        .unwrap_or(trimmed);
    if ext.is_empty() {
        return Err(reject("pattern has no extension"));
    }
    if ext.contains(['/', '\\']) {
        return Err(reject("pattern must not contain path separators"));
    }
    Ok(format!("*.{}", ext.to_lowercase()))
}

fn compile(pattern: &str) -> Result<Glob> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .map_err(|e| EngineError::InvalidRule {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Pick the winning rule among `candidates` (indices into `rules`).
fn best<'a>(rules: &'a [MappingRule], candidates: impl Iterator<Item = usize>) -> Option<&'a MappingRule> {
    candidates
        .min_by_key(|&i| (Reverse(rules[i].priority), i))
        .map(|i| &rules[i])
}

/// Resolve the destination directory for `file_path`.
///
/// The highest-priority matching rule wins; ties go to the rule declared
/// first. Returns `None` when no rule matches.
pub fn resolve<'a>(file_path: &Path, rules: &'a [MappingRule]) -> Option<&'a Path> {
    let candidates = rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.matches(file_path))
        .map(|(i, _)| i);
    best(rules, candidates).map(MappingRule::target_dir)
}

/// A rule list precompiled into a single glob set for resolving many files.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<MappingRule>,
    set: GlobSet,
}

impl RuleSet {
    pub fn new(rules: &[MappingRule]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for rule in rules {
            builder.add(compile(rule.pattern())?);
        }
        let set = builder.build().map_err(|e| EngineError::InvalidRule {
            pattern: rules
                .iter()
                .map(MappingRule::pattern)
                .collect::<Vec<_>>()
                .join(","),
            reason: e.to_string(),
        })?;
        Ok(RuleSet {
            rules: rules.to_vec(),
            set,
        })
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn resolve(&self, file_path: &Path) -> Option<&Path> {
        let name = file_path.file_name()?;
        let hits = self.set.matches(name);
        best(&self.rules, hits.into_iter()).map(MappingRule::target_dir)
    }
}
