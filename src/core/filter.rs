//! Composable ternary filter rules
//!
//! A rule answers [`FilterStatus::Include`], [`FilterStatus::Exclude`] or
//! [`FilterStatus::Unknown`]. Unknown lets rules compose: combinators only
//! decide when some child has an opinion, and the [`filter`] stage itself
//! drops an item only on an explicit `Exclude`, so a rule that never matches
//! lets everything through.

use std::fmt;
use std::sync::Arc;

use glob::Pattern as GlobPattern;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::cancel::CancelToken;
use super::pipeline::{process, ProcessStatus, Stage};
use crate::error::FerryError;

/// Errors that can occur while building filter rules
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid glob pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

impl From<FilterError> for FerryError {
    fn from(err: FilterError) -> Self {
        FerryError::Usage(err.to_string())
    }
}

/// Decision of a single rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterStatus {
    #[default]
    Unknown,
    Include,
    Exclude,
}

/// A predicate over pipeline items
pub trait FilterRule<T>: Send + Sync + fmt::Debug {
    fn filter(&self, entry: &T) -> FilterStatus;
}

/// Anything with a base name that name-matching rules can test
pub trait EntryName {
    /// Final path component, e.g. `b.txt` for `a/b.txt`
    fn entry_name(&self) -> &str;
}

impl EntryName for String {
    fn entry_name(&self) -> &str {
        base_name(self)
    }
}

impl EntryName for &str {
    fn entry_name(&self) -> &str {
        base_name(self)
    }
}

/// Last `/`-separated component, ignoring a trailing slash
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Swaps Include and Exclude; Unknown stays Unknown
#[derive(Debug)]
pub struct Not<R>(pub R);

impl<T, R: FilterRule<T>> FilterRule<T> for Not<R> {
    fn filter(&self, entry: &T) -> FilterStatus {
        match self.0.filter(entry) {
            FilterStatus::Include => FilterStatus::Exclude,
            FilterStatus::Exclude => FilterStatus::Include,
            FilterStatus::Unknown => FilterStatus::Unknown,
        }
    }
}

/// Anything the inner rule does not include is excluded
#[derive(Debug)]
pub struct IncludeOnly<R>(pub R);

impl<T, R: FilterRule<T>> FilterRule<T> for IncludeOnly<R> {
    fn filter(&self, entry: &T) -> FilterStatus {
        match self.0.filter(entry) {
            FilterStatus::Include => FilterStatus::Include,
            _ => FilterStatus::Exclude,
        }
    }
}

/// Boxed rule, as stored by the combinators
pub type BoxedRule<T> = Box<dyn FilterRule<T>>;

/// Every child must agree.
///
/// Leading Unknowns are skipped; once a child has decided, any later child
/// that disagrees or has no opinion yields Unknown.
pub struct All<T>(pub Vec<BoxedRule<T>>);

impl<T> fmt::Debug for All<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("All").field(&self.0).finish()
    }
}

impl<T> FilterRule<T> for All<T> {
    fn filter(&self, entry: &T) -> FilterStatus {
        let mut status = FilterStatus::Unknown;
        for rule in &self.0 {
            let current = rule.filter(entry);
            if status == FilterStatus::Unknown {
                status = current;
            } else if status != current {
                return FilterStatus::Unknown;
            }
        }
        status
    }
}

/// The first child with an opinion decides
pub struct Any<T>(pub Vec<BoxedRule<T>>);

impl<T> fmt::Debug for Any<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Any").field(&self.0).finish()
    }
}

impl<T> FilterRule<T> for Any<T> {
    fn filter(&self, entry: &T) -> FilterStatus {
        self.0
            .iter()
            .map(|rule| rule.filter(entry))
            .find(|status| *status != FilterStatus::Unknown)
            .unwrap_or(FilterStatus::Unknown)
    }
}

/// Passes the inner decision through, tracing it
#[derive(Debug)]
pub struct Logged<R> {
    pub label: String,
    pub rule: R,
}

impl<T: fmt::Debug, R: FilterRule<T>> FilterRule<T> for Logged<R> {
    fn filter(&self, entry: &T) -> FilterStatus {
        let status = self.rule.filter(entry);
        debug!(rule = %self.label, ?entry, ?status, "filter decision");
        status
    }
}

/// Includes entries whose base name matches a glob; Unknown otherwise
#[derive(Debug, Clone)]
pub struct IncludeGlob {
    pattern: GlobPattern,
}

impl IncludeGlob {
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        let compiled = GlobPattern::new(pattern).map_err(|e| FilterError::InvalidGlob {
            pattern: pattern.to_string(),
            source: e,
        })?;
        Ok(Self { pattern: compiled })
    }
}

impl<T: EntryName> FilterRule<T> for IncludeGlob {
    fn filter(&self, entry: &T) -> FilterStatus {
        if self.pattern.matches(entry.entry_name()) {
            FilterStatus::Include
        } else {
            FilterStatus::Unknown
        }
    }
}

/// Includes entries whose base name matches a regex; Unknown otherwise
#[derive(Debug, Clone)]
pub struct IncludeRegex {
    regex: Regex,
}

impl IncludeRegex {
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        let regex = Regex::new(pattern).map_err(|e| FilterError::InvalidRegex {
            pattern: pattern.to_string(),
            source: e,
        })?;
        Ok(Self { regex })
    }
}

impl<T: EntryName> FilterRule<T> for IncludeRegex {
    fn filter(&self, entry: &T) -> FilterStatus {
        if self.regex.is_match(entry.entry_name()) {
            FilterStatus::Include
        } else {
            FilterStatus::Unknown
        }
    }
}

/// Name pattern given on the command line: a glob, or a regex after `regex:`
#[derive(Debug, Clone)]
pub enum NamePattern {
    Glob(IncludeGlob),
    Regex(IncludeRegex),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self, FilterError> {
        match pattern.strip_prefix("regex:") {
            Some(regex) => Ok(NamePattern::Regex(IncludeRegex::new(regex)?)),
            None => Ok(NamePattern::Glob(IncludeGlob::new(pattern)?)),
        }
    }
}

impl<T: EntryName> FilterRule<T> for NamePattern {
    fn filter(&self, entry: &T) -> FilterStatus {
        match self {
            NamePattern::Glob(glob) => FilterRule::<T>::filter(glob, entry),
            NamePattern::Regex(regex) => FilterRule::<T>::filter(regex, entry),
        }
    }
}

/// `--include` / `--exclude` pattern pair accepted by the bulk operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParams {
    pub include: Option<String>,
    pub exclude: Option<String>,
}

impl FilterParams {
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }

    /// Rules in application order: only `include` matches pass, then `exclude` matches are dropped
    pub fn rules<T>(&self) -> Result<Vec<Arc<dyn FilterRule<T>>>, FilterError>
    where
        T: EntryName + fmt::Debug + 'static,
    {
        let mut rules: Vec<Arc<dyn FilterRule<T>>> = Vec::new();
        if let Some(include) = &self.include {
            rules.push(Arc::new(Logged {
                label: format!("include {}", include),
                rule: IncludeOnly(NamePattern::parse(include)?),
            }));
        }
        if let Some(exclude) = &self.exclude {
            rules.push(Arc::new(Logged {
                label: format!("exclude {}", exclude),
                rule: Not(NamePattern::parse(exclude)?),
            }));
        }
        Ok(rules)
    }

    /// Chain one [`filter`] stage per rule onto `input`
    pub fn apply<T>(&self, cancel: &CancelToken, input: Stage<T>) -> Result<Stage<T>, FilterError>
    where
        T: EntryName + fmt::Debug + Send + 'static,
    {
        Ok(self
            .rules()?
            .into_iter()
            .fold(input, |stage, rule| filter(cancel, stage, rule)))
    }
}

/// Pipeline stage dropping the items `rule` excludes
pub fn filter<T>(cancel: &CancelToken, input: Stage<T>, rule: Arc<dyn FilterRule<T>>) -> Stage<T>
where
    T: Send + 'static,
{
    process(
        cancel,
        input,
        move |_cancel, item: T| {
            let status = rule.filter(&item);
            async move {
                match status {
                    FilterStatus::Exclude => ProcessStatus::Skip,
                    _ => ProcessStatus::Output(item),
                }
            }
        },
        None,
    )
}
