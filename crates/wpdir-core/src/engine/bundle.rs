//! Bundle engine: a plain in-memory line scanner.
//!
//! Archives are JSON objects mapping file paths to their text. A generation
//! is a single `bundle.json` in the destination directory; opening it loads
//! every file into memory and searches scan lines with the `regex` crate.
//! Suited to small corpora, local mirrors and tests. Large deployments plug
//! in a trigram engine through [`IndexEngine`].

use super::{FileMatch, IndexEngine, IndexHandle, IndexRef, IndexSearchOptions, LineMatch, SearchResponse};
use crate::types::FileStats;
use anyhow::Context;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const BUNDLE_FILE: &str = "bundle.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredBundle {
    slug: String,
    files: BTreeMap<String, String>,
}

/// Index engine over JSON file bundles.
#[derive(Debug, Clone, Default)]
pub struct BundleEngine {
    /// Keep files whose name starts with a dot
    pub include_dot_files: bool,
}

impl BundleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode files as an archive this engine can build from.
    pub fn archive<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<u8> {
        let map: BTreeMap<&str, &str> = files.into_iter().collect();
        // a map of strings always serialises
        serde_json::to_vec(&map).unwrap_or_default()
    }

    fn is_dot_file(path: &str) -> bool {
        path.split('/').any(|part| part.starts_with('.'))
    }
}

impl IndexEngine for BundleEngine {
    fn build(&self, archive: &[u8], dst: &Path, slug: &str) -> anyhow::Result<(IndexRef, FileStats)> {
        let files: BTreeMap<String, String> =
            serde_json::from_slice(archive).context("archive is not a file bundle")?;

        let mut stats = FileStats::new();
        let files: BTreeMap<String, String> = files
            .into_iter()
            .filter(|(path, _)| self.include_dot_files || !Self::is_dot_file(path))
            .inspect(|(path, text)| stats.add_file(path.clone(), text.len() as u64))
            .collect();
        stats.generate_summary();

        fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
        let bundle = StoredBundle {
            slug: slug.to_string(),
            files,
        };
        let bytes = serde_json::to_vec(&bundle)?;
        fs::write(dst.join(BUNDLE_FILE), bytes).context("writing bundle")?;

        debug!(slug, files = stats.total_files, dir = %dst.display(), "Bundle built");
        Ok((IndexRef::new(slug, dst), stats))
    }

    fn read(&self, dir: &Path) -> anyhow::Result<IndexRef> {
        let bytes = fs::read(dir.join(BUNDLE_FILE))
            .with_context(|| format!("reading bundle in {}", dir.display()))?;
        let bundle: StoredBundle = serde_json::from_slice(&bytes).context("bundle is corrupted")?;
        Ok(IndexRef::new(bundle.slug, dir))
    }

    fn open(&self, index: &IndexRef) -> anyhow::Result<Box<dyn IndexHandle>> {
        let bytes = fs::read(index.dir.join(BUNDLE_FILE))
            .with_context(|| format!("opening bundle in {}", index.dir.display()))?;
        let bundle: StoredBundle = serde_json::from_slice(&bytes).context("bundle is corrupted")?;
        let files = bundle
            .files
            .into_iter()
            .map(|(name, text)| (name, text.lines().map(str::to_string).collect()))
            .collect();
        Ok(Box::new(BundleHandle {
            slug: index.slug.clone(),
            dir: index.dir.clone(),
            files,
        }))
    }

    fn name(&self) -> &'static str {
        "bundle"
    }
}

/// An opened bundle generation.
pub struct BundleHandle {
    slug: String,
    dir: PathBuf,
    files: Vec<(String, Vec<String>)>,
}

impl IndexHandle for BundleHandle {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn dir(&self) -> &Path {
        &self.dir
    }

    fn search(&self, pattern: &str, opts: &IndexSearchOptions) -> anyhow::Result<SearchResponse> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(opts.ignore_case)
            .build()?;
        let ctx = opts.lines_of_context as usize;

        let mut response = SearchResponse::default();
        let mut skipped = 0u32;
        for (name, lines) in &self.files {
            response.files_opened += 1;
            let matches: Vec<LineMatch> = lines
                .iter()
                .enumerate()
                .filter(|(_, line)| re.is_match(line))
                .map(|(i, line)| LineMatch {
                    line: line.clone(),
                    line_number: i as u32 + 1,
                    before: lines[i.saturating_sub(ctx)..i].to_vec(),
                    after: lines[(i + 1).min(lines.len())..(i + 1 + ctx).min(lines.len())].to_vec(),
                })
                .collect();
            if matches.is_empty() {
                continue;
            }
            response.files_with_match += 1;
            if skipped < opts.offset {
                skipped += 1;
                continue;
            }
            if opts.limit > 0 && response.matches.len() >= opts.limit as usize {
                continue;
            }
            response.matches.push(FileMatch {
                filename: name.clone(),
                matches,
            });
        }
        Ok(response)
    }

    fn destroy(self: Box<Self>) -> anyhow::Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("removing {}", self.dir.display()))?;
        }
        Ok(())
    }
}
