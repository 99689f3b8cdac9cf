//! Upstream collaborator traits.
//!
//! The directory exposes three services the pipeline depends on: the
//! changelog/listing service, the per-package info API and the archive
//! download host. Their wire protocols live outside this crate.

use crate::types::{ChangelogEntry, CorpusKind, Revision};

/// Changelog and listing access for a corpus.
pub trait Upstream: Send + Sync {
    /// Latest revision of the corpus changelog.
    fn latest_revision(&self, corpus: CorpusKind) -> anyhow::Result<Revision>;

    /// Entries committed after `from`, up to and including `to`, oldest first.
    fn changelog(
        &self,
        corpus: CorpusKind,
        from: Revision,
        to: Revision,
    ) -> anyhow::Result<Vec<ChangelogEntry>>;

    /// Every slug currently published in the corpus.
    fn list(&self, corpus: CorpusKind) -> anyhow::Result<Vec<String>>;
}

/// Per-package info API.
pub trait MetadataSource: Send + Sync {
    /// Raw JSON info document for a package.
    fn fetch_info(&self, corpus: CorpusKind, slug: &str) -> anyhow::Result<Vec<u8>>;
}

/// Outcome of an archive download that reached the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveResponse {
    /// 200 with the archive body
    Found(Vec<u8>),
    /// 404: the package is no longer published
    NotFound,
    /// Any other status
    Status(u16),
}

impl ArchiveResponse {
    /// Map a raw HTTP status and body.
    pub fn from_status(status: u16, body: Vec<u8>) -> Self {
        match status {
            200 => ArchiveResponse::Found(body),
            404 => ArchiveResponse::NotFound,
            other => ArchiveResponse::Status(other),
        }
    }
}

/// Archive download host.
pub trait ArchiveSource: Send + Sync {
    /// Download the latest stable archive. Transport failures are `Err`.
    fn fetch_archive(&self, corpus: CorpusKind, slug: &str) -> anyhow::Result<ArchiveResponse>;
}

/// Download URL of the latest stable archive on the public host.
pub fn archive_url(corpus: CorpusKind, slug: &str) -> String {
    format!(
        "https://downloads.wordpress.org/{}/{}.latest-stable.zip?nostats=1",
        corpus.singular(),
        slug
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_response_from_status() {
        assert_eq!(
            ArchiveResponse::from_status(200, vec![1]),
            ArchiveResponse::Found(vec![1])
        );
        assert_eq!(ArchiveResponse::from_status(404, vec![]), ArchiveResponse::NotFound);
        assert_eq!(ArchiveResponse::from_status(503, vec![]), ArchiveResponse::Status(503));
    }

    #[test]
    fn test_archive_url() {
        assert_eq!(
            archive_url(CorpusKind::Themes, "twentytwenty"),
            "https://downloads.wordpress.org/theme/twentytwenty.latest-stable.zip?nostats=1"
        );
    }
}
