//! Search records and their results.
//!
//! A [`Search`] moves strictly forward through Queued, Started and
//! Completed. Its results are split into a [`Summary`] (one
//! [`PackageResult`] per matching package) and [`Matches`] (matching lines
//! grouped by slug); both are persisted once the search completes.

use crate::error::{Result, WpdirError};
use crate::types::{CorpusKind, Revision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use crate::engine::IndexSearchOptions as SearchOptions;

/// Lifecycle of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Queued,
    Started,
    Completed,
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStatus::Queued => write!(f, "queued"),
            SearchStatus::Started => write!(f, "started"),
            SearchStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A search submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Regex pattern
    pub input: String,
    pub target: CorpusKind,
    /// Private searches are not listed in the public history
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub options: SearchOptions,
}

impl SearchRequest {
    pub fn new(input: impl Into<String>, target: CorpusKind) -> Self {
        SearchRequest {
            input: input.into(),
            target,
            private: false,
            options: SearchOptions::default(),
        }
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject empty input and patterns that do not compile.
    pub fn validate(&self) -> Result<()> {
        if self.input.trim().is_empty() {
            return Err(WpdirError::InvalidPattern {
                pattern: self.input.clone(),
                reason: "empty pattern".to_string(),
            });
        }
        regex::RegexBuilder::new(&self.input)
            .case_insensitive(self.options.ignore_case)
            .build()
            .map_err(|e| WpdirError::InvalidPattern {
                pattern: self.input.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// A search and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Search {
    pub id: String,
    pub input: String,
    pub target: CorpusKind,
    pub private: bool,
    pub options: SearchOptions,
    pub status: SearchStatus,
    /// Percentage of packages visited, 0-100
    pub progress: u8,
    pub match_count: u64,
    /// Corpus revision the search ran against
    pub revision: Revision,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl Search {
    /// A Queued search for `request`.
    pub fn new(id: impl Into<String>, request: SearchRequest) -> Self {
        Search {
            id: id.into(),
            input: request.input,
            target: request.target,
            private: request.private,
            options: request.options,
            status: SearchStatus::Queued,
            progress: 0,
            match_count: 0,
            revision: 0,
            created: Utc::now(),
            started: None,
            completed: None,
        }
    }

    /// Move to Started. No-op unless Queued.
    pub fn start(&mut self, revision: Revision) {
        if self.status != SearchStatus::Queued {
            return;
        }
        self.status = SearchStatus::Started;
        self.started = Some(Utc::now());
        self.revision = revision;
        self.progress = 0;
        self.match_count = 0;
    }

    /// Publish mid-flight progress. Ignored once Completed.
    pub fn advance(&mut self, progress: u8, match_count: u64) {
        if self.status == SearchStatus::Completed {
            return;
        }
        self.progress = progress.min(100).max(self.progress);
        self.match_count = match_count.max(self.match_count);
    }

    /// Move to Completed with the final match count.
    pub fn complete(&mut self, match_count: u64) {
        if self.status == SearchStatus::Completed {
            return;
        }
        self.status = SearchStatus::Completed;
        self.progress = 100;
        self.match_count = match_count;
        self.completed = Some(Utc::now());
        if self.started.is_none() {
            self.started = self.completed;
        }
    }

    /// Timestamp used to order the public history.
    pub fn sort_time(&self) -> DateTime<Utc> {
        self.started.unwrap_or(self.created)
    }

    pub fn view(&self, queue_position: i64) -> SearchView {
        SearchView {
            id: self.id.clone(),
            input: self.input.clone(),
            repo: self.target,
            matches: self.match_count,
            started: self.started,
            completed: self.completed,
            progress: self.progress,
            status: self.status,
            queue_position,
            options: self.options.clone(),
        }
    }
}

/// Read model for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchView {
    pub id: String,
    pub input: String,
    pub repo: CorpusKind,
    pub matches: u64,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub progress: u8,
    pub status: SearchStatus,
    /// -1 when the search is not waiting in the queue
    pub queue_position: i64,
    pub options: SearchOptions,
}

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub slug: String,
    pub file: String,
    pub line_num: u32,
    pub line_text: String,
}

/// Per-package entry of a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResult {
    pub slug: String,
    pub name: String,
    pub version: String,
    pub homepage: String,
    pub installs: u64,
    pub matches: u64,
}

/// Packages that matched a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub list: BTreeMap<String, PackageResult>,
    /// Number of packages with at least one match
    pub total: u64,
}

impl Summary {
    pub fn get(&self, slug: &str) -> Option<&PackageResult> {
        self.list.get(slug)
    }

    /// Results ordered by active installs, most popular first.
    pub fn by_installs(&self) -> Vec<&PackageResult> {
        let mut list: Vec<&PackageResult> = self.list.values().collect();
        list.sort_by(|a, b| b.installs.cmp(&a.installs).then_with(|| a.slug.cmp(&b.slug)));
        list
    }
}

/// Matching lines grouped by slug.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matches {
    pub list: BTreeMap<String, Vec<Match>>,
}

impl Matches {
    pub fn for_slug(&self, slug: &str) -> &[Match] {
        self.list.get(slug).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total matching lines across all packages.
    pub fn total(&self) -> u64 {
        self.list.values().map(|m| m.len() as u64).sum()
    }
}

/// Truncate `text` to at most `max` bytes on a char boundary.
pub fn truncate_line(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// `round(processed / total * 100)`, 100 for an empty corpus.
pub fn progress_percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((processed as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(SearchRequest::new("add_action\\(", CorpusKind::Plugins).validate().is_ok());
        assert!(matches!(
            SearchRequest::new("   ", CorpusKind::Plugins).validate(),
            Err(WpdirError::InvalidPattern { .. })
        ));
        assert!(matches!(
            SearchRequest::new("(unclosed", CorpusKind::Themes).validate(),
            Err(WpdirError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut search = Search::new("s1", SearchRequest::new("foo", CorpusKind::Plugins));
        assert_eq!(search.status, SearchStatus::Queued);

        search.start(7);
        assert_eq!(search.status, SearchStatus::Started);
        assert_eq!(search.revision, 7);
        assert!(search.started.is_some());

        search.advance(40, 3);
        search.advance(20, 1);
        assert_eq!(search.progress, 40);
        assert_eq!(search.match_count, 3);

        search.complete(5);
        assert_eq!(search.status, SearchStatus::Completed);
        assert_eq!(search.progress, 100);

        search.start(9);
        search.advance(10, 99);
        assert_eq!(search.status, SearchStatus::Completed);
        assert_eq!(search.revision, 7);
        assert_eq!(search.match_count, 5);
        assert!(SearchStatus::Queued < SearchStatus::Started);
    }

    #[test]
    fn test_truncate_line_respects_char_boundary() {
        assert_eq!(truncate_line("short", 100), "short");
        assert_eq!(truncate_line("abcdef", 3), "abc");
        // 'é' is two bytes, cutting at 2 would split it
        assert_eq!(truncate_line("aé", 2), "a");
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 0), 100);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(3, 3), 100);
    }

    #[test]
    fn test_summary_ordering() {
        let mut summary = Summary::default();
        for (slug, installs) in [("a", 10), ("b", 500), ("c", 10)] {
            summary.list.insert(
                slug.to_string(),
                PackageResult {
                    slug: slug.to_string(),
                    name: slug.to_uppercase(),
                    version: "1.0".to_string(),
                    homepage: String::new(),
                    installs,
                    matches: 1,
                },
            );
        }
        let order: Vec<&str> = summary.by_installs().iter().map(|r| r.slug.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }
}
