//! Core data types for wpdir.
//!
//! These are the small, serialisable values shared by the update pipeline
//! and the search engine: corpus kinds, package status, update requests,
//! package metadata and file statistics.

use crate::error::WpdirError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream changelog cursor.
pub type Revision = u64;

/// Which upstream directory a package belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusKind {
    Plugins,
    Themes,
}

impl CorpusKind {
    /// All corpora served by the directory.
    pub const ALL: [CorpusKind; 2] = [CorpusKind::Plugins, CorpusKind::Themes];

    /// Plural name, used as store bucket and index directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusKind::Plugins => "plugins",
            CorpusKind::Themes => "themes",
        }
    }

    /// Singular name, as used in archive download paths.
    pub fn singular(&self) -> &'static str {
        match self {
            CorpusKind::Plugins => "plugin",
            CorpusKind::Themes => "theme",
        }
    }
}

impl fmt::Display for CorpusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorpusKind {
    type Err = WpdirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plugins" | "plugin" => Ok(CorpusKind::Plugins),
            "themes" | "theme" => Ok(CorpusKind::Themes),
            _ => Err(WpdirError::UnknownCorpus {
                name: s.to_string(),
            }),
        }
    }
}

/// Whether a package currently has a usable live index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PackageStatus {
    Open,
    #[default]
    Closed,
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageStatus::Open => write!(f, "Open"),
            PackageStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// A unit of update work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub slug: String,
    pub corpus: CorpusKind,
    pub revision: Revision,
}

impl UpdateRequest {
    pub fn new(slug: impl Into<String>, corpus: CorpusKind, revision: Revision) -> Self {
        UpdateRequest {
            slug: slug.into(),
            corpus,
            revision,
        }
    }
}

/// One changelog line: a package touched at a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogEntry {
    pub slug: String,
    pub revision: Revision,
}

impl ChangelogEntry {
    pub fn new(slug: impl Into<String>, revision: Revision) -> Self {
        ChangelogEntry {
            slug: slug.into(),
            revision,
        }
    }
}

/// Package metadata as returned by the directory info API.
///
/// Unknown fields are ignored so the API can grow without breaking refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageMeta {
    pub name: String,
    pub version: String,
    pub author: String,
    pub author_profile: String,
    pub homepage: String,
    pub short_description: String,
    pub requires: String,
    pub tested: String,
    pub requires_php: String,
    pub rating: u32,
    pub num_ratings: u32,
    pub support_threads: u32,
    pub support_threads_resolved: u32,
    pub active_installs: u64,
    pub downloaded: u64,
    pub last_updated: String,
    pub added: String,
    pub download_link: String,
    pub stable_tag: String,
}

impl PackageMeta {
    /// Parse the raw info API response.
    ///
    /// The API reports missing packages as `{"error": "..."}` with a 200.
    pub fn from_api_json(bytes: &[u8]) -> crate::error::Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
            return Err(WpdirError::serialization(format!("info api: {}", err)));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// A single file inside a package archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub extension: String,
    pub size: u64,
}

/// Share of code size per language, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageShare {
    pub php: u8,
    pub js: u8,
    pub css: u8,
}

/// File statistics produced as a side effect of an index build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub files: Vec<FileEntry>,
    pub total_files: u64,
    pub total_size: u64,
    pub summary: LanguageShare,
}

impl FileStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file. Directories are not passed in.
    pub fn add_file(&mut self, name: impl Into<String>, size: u64) {
        let name = name.into();
        let extension = name
            .rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty() && !stem.ends_with('/'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        self.total_files += 1;
        self.total_size += size;
        self.files.push(FileEntry {
            name,
            extension,
            size,
        });
    }

    /// Recompute the language share over PHP, JS and CSS bytes.
    pub fn generate_summary(&mut self) {
        let (mut php, mut js, mut css) = (0u64, 0u64, 0u64);
        for file in &self.files {
            match file.extension.as_str() {
                "php" => php += file.size,
                "js" => js += file.size,
                "css" => css += file.size,
                _ => {}
            }
        }
        let total = php + js + css;
        if total == 0 {
            self.summary = LanguageShare::default();
            return;
        }
        let pct = |n: u64| ((n as f64 / total as f64) * 100.0).round() as u8;
        self.summary = LanguageShare {
            php: pct(php),
            js: pct(js),
            css: pct(css),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corpus_kind_parse() {
        assert_eq!("plugins".parse::<CorpusKind>().unwrap(), CorpusKind::Plugins);
        assert_eq!("Theme".parse::<CorpusKind>().unwrap(), CorpusKind::Themes);
        assert!(matches!(
            "blocks".parse::<CorpusKind>(),
            Err(WpdirError::UnknownCorpus { .. })
        ));
        assert_eq!(CorpusKind::Themes.singular(), "theme");
    }

    #[test]
    fn test_meta_from_api_json() {
        let json = br#"{"name":"Hello Dolly","version":"1.7.2","active_installs":300000,"sections":{"faq":"x"}}"#;
        let meta = PackageMeta::from_api_json(json).unwrap();
        assert_eq!(meta.name, "Hello Dolly");
        assert_eq!(meta.version, "1.7.2");
        assert_eq!(meta.active_installs, 300_000);

        let err = PackageMeta::from_api_json(br#"{"error":"Plugin not found."}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_file_stats_summary() {
        let mut stats = FileStats::new();
        stats.add_file("hello.php", 300);
        stats.add_file("assets/app.js", 100);
        stats.add_file("assets/style.css", 100);
        stats.add_file("readme.txt", 1000);
        stats.add_file(".htaccess", 10);
        stats.generate_summary();

        assert_eq!(stats.total_files, 5);
        assert_eq!(stats.total_size, 1510);
        assert_eq!(stats.files[4].extension, "");
        assert_eq!(
            stats.summary,
            LanguageShare {
                php: 60,
                js: 20,
                css: 20
            }
        );
    }
}
