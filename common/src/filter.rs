//! Include/exclude filtering of paths below a synchronized root
//!
//! Patterns are globs matched against the path relative to the root, with `/` as separator.
//!
//! # Pattern Syntax
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/` (crosses directories)
//! - `?` matches a single character (except `/`)
//! - `[...]` character classes
//! - a leading `/` is accepted and ignored, patterns are always relative to the root
//! - a trailing `/` matches only directories
//!
//! # Subtree rules
//!
//! An excluded directory hides its whole subtree. A directory that matches an include pattern
//! brings its whole subtree along, whatever lies below it: neither include nor exclude patterns
//! are consulted inside it ([`FilterSettings::is_explicitly_included`]). Without include patterns
//! nothing is explicitly included and excludes apply at every depth.
//!
//! ```
//! use common::filter::{FilterResult, FilterSettings};
//! use std::path::Path;
//!
//! let mut settings = FilterSettings::default();
//! settings.add_include("**/*.txt").unwrap();
//! settings.add_exclude("target/").unwrap();
//!
//! assert!(matches!(
//!     settings.check(Path::new("notes/a.txt"), false),
//!     FilterResult::Included
//! ));
//! assert!(matches!(
//!     settings.check(Path::new("target"), true),
//!     FilterResult::ExcludedByPattern(_)
//! ));
//! assert!(matches!(
//!     settings.check(Path::new("main.rs"), false),
//!     FilterResult::ExcludedByDefault
//! ));
//! ```

use anyhow::{Context, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

/// Compiled glob, remembering the text it came from so it can be sent over the wire.
#[derive(Debug, Clone)]
pub struct FilterPattern {
    pub original: String,
    matcher: globset::GlobMatcher,
    pub dir_only: bool,
}

impl FilterPattern {
    pub fn parse(pattern: &str) -> anyhow::Result<Self> {
        let dir_only = pattern.ends_with('/');
        let glob = pattern.trim_start_matches('/').trim_end_matches('/');
        if glob.is_empty() {
            return Err(anyhow!("filter pattern {:?} is empty", pattern));
        }
        let matcher = globset::GlobBuilder::new(glob)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .with_context(|| format!("invalid filter pattern {:?}", pattern))?
            .compile_matcher();
        Ok(Self {
            original: pattern.to_string(),
            matcher,
            dir_only,
        })
    }

    pub fn matches(&self, relative_path: &Path, is_dir: bool) -> bool {
        (is_dir || !self.dir_only) && self.matcher.is_match(relative_path)
    }
}

#[derive(Debug, Clone)]
pub enum FilterResult {
    Included,
    /// include patterns exist but none matched; directories are still descended into
    ExcludedByDefault,
    /// an exclude pattern matched; the whole subtree is skipped
    ExcludedByPattern(String),
}

/// Which side of a filter a pattern lands on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    Include,
    Exclude,
}

impl Rule {
    /// Splits a filter file line such as `--exclude target/`.
    fn split_line(line: &str) -> Option<(Rule, &str)> {
        let (flag, pattern) = line.split_once(char::is_whitespace)?;
        let rule = match flag {
            "--include" => Rule::Include,
            "--exclude" => Rule::Exclude,
            _ => return None,
        };
        Some((rule, pattern.trim()))
    }
}

/// Include and exclude patterns applied to every entry a scan visits.
#[derive(Debug, Clone, Default)]
pub struct FilterSettings {
    /// if non-empty, only matching paths are included
    pub includes: Vec<FilterPattern>,
    pub excludes: Vec<FilterPattern>,
}

impl FilterSettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, rule: Rule, pattern: &str) -> anyhow::Result<()> {
        let pattern = FilterPattern::parse(pattern)?;
        match rule {
            Rule::Include => self.includes.push(pattern),
            Rule::Exclude => self.excludes.push(pattern),
        }
        Ok(())
    }

    /// Builds settings from at most one include and one exclude glob.
    pub fn from_globs(include: Option<&str>, exclude: Option<&str>) -> anyhow::Result<Self> {
        let mut settings = Self::new();
        for (rule, pattern) in [(Rule::Include, include), (Rule::Exclude, exclude)] {
            if let Some(pattern) = pattern {
                settings.add(rule, pattern)?;
            }
        }
        Ok(settings)
    }

    pub fn add_include(&mut self, pattern: &str) -> anyhow::Result<()> {
        self.add(Rule::Include, pattern)
    }

    pub fn add_exclude(&mut self, pattern: &str) -> anyhow::Result<()> {
        self.add(Rule::Exclude, pattern)
    }

    /// True if an include pattern matches; being included only because there are no include
    /// patterns doesn't count.
    #[must_use]
    pub fn is_explicitly_included(&self, relative_path: &Path, is_dir: bool) -> bool {
        self.includes
            .iter()
            .any(|pattern| pattern.matches(relative_path, is_dir))
    }

    /// Excludes are checked first; if any include patterns exist, one of them must match.
    pub fn check(&self, relative_path: &Path, is_dir: bool) -> FilterResult {
        if let Some(pattern) = self
            .excludes
            .iter()
            .find(|pattern| pattern.matches(relative_path, is_dir))
        {
            return FilterResult::ExcludedByPattern(pattern.original.clone());
        }
        let included = self.includes.is_empty()
            || self
                .includes
                .iter()
                .any(|pattern| pattern.matches(relative_path, is_dir));
        if included {
            FilterResult::Included
        } else {
            FilterResult::ExcludedByDefault
        }
    }

    /// Reads a filter file: one `--include PATTERN` or `--exclude PATTERN` per line, blank lines
    /// and `#` comments ignored.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read filter file {:?}", path))?;
        Self::parse_content(&content).with_context(|| format!("in filter file {:?}", path))
    }

    pub fn parse_content(content: &str) -> anyhow::Result<Self> {
        let mut settings = Self::new();
        let lines = content
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));
        for (index, line) in lines {
            let (rule, pattern) = Rule::split_line(line).ok_or_else(|| {
                anyhow!(
                    "line {}: expected '--include PATTERN' or '--exclude PATTERN', got {:?}",
                    index + 1,
                    line
                )
            })?;
            settings
                .add(rule, pattern)
                .with_context(|| format!("line {}", index + 1))?;
        }
        Ok(settings)
    }
}

/// Patterns travel as their original strings and are recompiled on the receiving side.
#[derive(Serialize, Deserialize)]
struct WirePatterns {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl Serialize for FilterSettings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let originals = |patterns: &[FilterPattern]| -> Vec<String> {
            patterns.iter().map(|p| p.original.clone()).collect()
        };
        WirePatterns {
            includes: originals(&self.includes),
            excludes: originals(&self.excludes),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FilterSettings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WirePatterns::deserialize(deserializer)?;
        let mut settings = FilterSettings::new();
        let rules = wire
            .includes
            .iter()
            .map(|pattern| (Rule::Include, pattern))
            .chain(wire.excludes.iter().map(|pattern| (Rule::Exclude, pattern)));
        for (rule, pattern) in rules {
            settings
                .add(rule, pattern)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(settings)
    }
}
