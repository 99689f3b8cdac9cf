//! Persistence for corpus state and search results.
//!
//! Everything goes through a bucketed key-value store ([`KvStore`]). Two
//! implementations ship with the crate: [`MemoryStore`] and the
//! directory-backed [`DirStore`], which writes one file per key.
//!
//! ## Layout
//!
//! ```text
//! repos/<corpus>            decimal revision
//! <corpus>/<slug>           package record (JSON)
//! searches/<id>             search record (framed blob)
//! searches/<id>_summary     summary (framed blob)
//! searches/<id>_matches     matches (framed blob)
//! searches_public/<time>_<id>  id of a public search
//! ```
//!
//! ## Blob Format
//!
//! ```text
//! [Payload: variable]
//!   - bincode, lz4 compressed with a u32 size prefix
//! [Footer: 8 bytes]
//!   - CRC32 of the payload: u32 LE
//!   - Magic: "WPDB" (4 bytes)
//! ```

use crate::error::{Result, WpdirError};
use crate::package::StoredPackage;
use crate::search::{Matches, Search, Summary};
use crate::types::{CorpusKind, Revision};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bucket holding one decimal revision per corpus
pub const REPOS_BUCKET: &str = "repos";
/// Bucket holding search records and their artifacts
pub const SEARCHES_BUCKET: &str = "searches";
/// Bucket indexing public searches by start time
pub const PUBLIC_BUCKET: &str = "searches_public";

/// Magic bytes at the end of framed blobs
pub const BLOB_MAGIC: &[u8; 4] = b"WPDB";
const FOOTER_LEN: usize = 8;

/// A bucketed byte store.
pub trait KvStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removing a missing key is not an error.
    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// All entries of a bucket in key order.
    fn scan(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn delete_bucket(&self, bucket: &str) -> Result<()>;
}

/// Volatile store, used in tests and for throwaway mirrors.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(b) = self.buckets.write().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn scan(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.write().remove(bucket);
        Ok(())
    }
}

/// One directory per bucket, one file per key.
///
/// File names are the hex-encoded key so any slug or id is a safe name.
/// Keys too long for that are stored under a name derived from a v5 uuid of
/// the key, and the file starts with the key itself:
///
/// ```text
/// [Key length: u32 LE][Key: UTF-8][Value]
/// ```
///
/// Every write goes to its own temp file in the bucket and is renamed into
/// place, so concurrent writers of one key never share a file.
pub struct DirStore {
    base_dir: PathBuf,
}

impl DirStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| WpdirError::StoreUnavailable {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;
        if !base_dir.is_dir() {
            return Err(WpdirError::StoreUnavailable {
                path: base_dir,
                reason: "not a directory".to_string(),
            });
        }
        debug!(path = %base_dir.display(), "Store opened");
        Ok(DirStore { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.base_dir.join(encode_key(bucket))
    }

    fn key_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(file_name(key))
    }
}

impl KvStore for DirStore {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(&dir)?;

        let mut file = NamedTempFile::new_in(&dir)?;
        if is_long_key(key) {
            file.write_all(&(key.len() as u32).to_le_bytes())?;
            file.write_all(key.as_bytes())?;
        }
        file.write_all(value)?;
        file.as_file().sync_all()?;
        file.persist(self.key_path(bucket, key)).map_err(|e| e.error)?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let bytes = match fs::read(self.key_path(bucket, key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !is_long_key(key) {
            return Ok(Some(bytes));
        }
        match split_long_entry(&bytes) {
            Some((stored, value)) if stored == key => Ok(Some(value.to_vec())),
            _ => Ok(None),
        }
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(bucket, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let dir = self.bucket_dir(bucket);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(LONG_KEY_PREFIX) {
                let bytes = fs::read(entry.path())?;
                match split_long_entry(&bytes) {
                    Some((key, value)) => out.push((key, value.to_vec())),
                    None => warn!(file = %name, "Skipping unreadable long-key entry"),
                }
                continue;
            }
            let Some(key) = decode_key(name) else {
                // temp files and strays
                continue;
            };
            out.push((key, fs::read(entry.path())?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn delete_bucket(&self, bucket: &str) -> Result<()> {
        match fs::remove_dir_all(self.bucket_dir(bucket)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Longest hex name used as is; longer keys are stored by uuid
const MAX_HEX_NAME: usize = 200;
const LONG_KEY_PREFIX: char = '~';

fn is_long_key(key: &str) -> bool {
    key.len() * 2 > MAX_HEX_NAME
}

fn file_name(key: &str) -> String {
    if is_long_key(key) {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
        format!("{}{}", LONG_KEY_PREFIX, id.simple())
    } else {
        encode_key(key)
    }
}

/// Split a long-key file into its key and value.
fn split_long_entry(bytes: &[u8]) -> Option<(String, &[u8])> {
    let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let key = bytes.get(4..4 + len)?;
    let value = bytes.get(4 + len..)?;
    Some((String::from_utf8(key.to_vec()).ok()?, value))
}

fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_key(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Frame a value: bincode, lz4 with size prefix, CRC32 footer.
pub fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(value)?;
    let mut blob = lz4_flex::compress_prepend_size(&bytes);
    let checksum = crc32fast::hash(&blob);
    blob.extend_from_slice(&checksum.to_le_bytes());
    blob.extend_from_slice(BLOB_MAGIC);
    Ok(blob)
}

/// Validate and decode a blob produced by [`encode_blob`].
pub fn decode_blob<T: DeserializeOwned>(key: &str, blob: &[u8]) -> Result<T> {
    let corrupted = |reason: String| WpdirError::Corrupted {
        key: key.to_string(),
        reason,
    };

    if blob.len() < FOOTER_LEN {
        return Err(corrupted("truncated blob".to_string()));
    }
    let (payload, footer) = blob.split_at(blob.len() - FOOTER_LEN);
    if &footer[4..8] != BLOB_MAGIC {
        return Err(corrupted("invalid footer magic bytes".to_string()));
    }

    let stored = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(corrupted(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            stored, computed
        )));
    }

    let bytes = lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| corrupted(format!("decompression failed: {}", e)))?;
    bincode::deserialize(&bytes).map_err(|e| corrupted(format!("deserialization failed: {}", e)))
}

/// Typed access to everything wpdir persists.
#[derive(Clone)]
pub struct ResultStore {
    kv: Arc<dyn KvStore>,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        ResultStore { kv }
    }

    /// Volatile store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Directory-backed store under `dir`.
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(DirStore::open(dir)?)))
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    // === Corpus state ===

    pub fn save_revision(&self, corpus: CorpusKind, revision: Revision) -> Result<()> {
        self.kv
            .put(REPOS_BUCKET, corpus.as_str(), revision.to_string().as_bytes())
    }

    /// Persisted revision, `None` if never saved.
    pub fn load_revision(&self, corpus: CorpusKind) -> Result<Option<Revision>> {
        let Some(bytes) = self.kv.get(REPOS_BUCKET, corpus.as_str())? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        text.trim()
            .parse::<Revision>()
            .map(Some)
            .map_err(|e| WpdirError::Corrupted {
                key: format!("{}/{}", REPOS_BUCKET, corpus),
                reason: e.to_string(),
            })
    }

    pub fn save_package(&self, corpus: CorpusKind, package: &StoredPackage) -> Result<()> {
        let bytes = serde_json::to_vec(package)?;
        self.kv.put(corpus.as_str(), &package.slug, &bytes)
    }

    pub fn delete_package(&self, corpus: CorpusKind, slug: &str) -> Result<()> {
        self.kv.delete(corpus.as_str(), slug)
    }

    /// All persisted records of a corpus. Malformed records are skipped.
    pub fn load_packages(&self, corpus: CorpusKind) -> Result<Vec<StoredPackage>> {
        let entries = self.kv.scan(corpus.as_str())?;
        let mut packages = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match serde_json::from_slice::<StoredPackage>(&bytes) {
                Ok(p) if !p.slug.trim().is_empty() => packages.push(p),
                Ok(_) => warn!(corpus = %corpus, key = %key, "Skipping record without slug"),
                Err(e) => warn!(corpus = %corpus, key = %key, error = %e, "Skipping malformed record"),
            }
        }
        Ok(packages)
    }

    // === Searches ===

    /// Persist a search record; public ones are also indexed by start time.
    pub fn save_search(&self, search: &Search) -> Result<()> {
        self.kv
            .put(SEARCHES_BUCKET, &search.id, &encode_blob(search)?)?;
        if !search.private {
            let key = format!("{:020}_{}", search.sort_time().timestamp_millis().max(0), search.id);
            self.kv.put(PUBLIC_BUCKET, &key, search.id.as_bytes())?;
        }
        Ok(())
    }

    pub fn load_search(&self, id: &str) -> Result<Option<Search>> {
        self.load_blob(id)
    }

    pub fn save_summary(&self, id: &str, summary: &Summary) -> Result<()> {
        self.kv
            .put(SEARCHES_BUCKET, &summary_key(id), &encode_blob(summary)?)
    }

    pub fn load_summary(&self, id: &str) -> Result<Option<Summary>> {
        self.load_blob(&summary_key(id))
    }

    pub fn save_matches(&self, id: &str, matches: &Matches) -> Result<()> {
        self.kv
            .put(SEARCHES_BUCKET, &matches_key(id), &encode_blob(matches)?)
    }

    pub fn load_matches(&self, id: &str) -> Result<Option<Matches>> {
        self.load_blob(&matches_key(id))
    }

    /// Most recent public searches, newest first.
    pub fn latest_public(&self, limit: usize) -> Result<Vec<Search>> {
        let index = self.kv.scan(PUBLIC_BUCKET)?;
        let mut out = Vec::with_capacity(limit.min(index.len()));
        for (key, id) in index.into_iter().rev() {
            if out.len() >= limit {
                break;
            }
            let id = String::from_utf8_lossy(&id).into_owned();
            match self.load_search(&id) {
                Ok(Some(search)) => out.push(search),
                Ok(None) => debug!(key = %key, "Public index points at a missing search"),
                Err(e) => warn!(id = %id, error = %e, "Skipping unreadable search"),
            }
        }
        Ok(out)
    }

    /// Drop every persisted search and the public index.
    pub fn clear_searches(&self) -> Result<()> {
        self.kv.delete_bucket(SEARCHES_BUCKET)?;
        self.kv.delete_bucket(PUBLIC_BUCKET)
    }

    fn load_blob<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(SEARCHES_BUCKET, key)? {
            Some(blob) => decode_blob(key, &blob).map(Some),
            None => Ok(None),
        }
    }
}

fn summary_key(id: &str) -> String {
    format!("{}_summary", id)
}

fn matches_key(id: &str) -> String {
    format!("{}_matches", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{Match, SearchRequest};
    use crate::types::PackageMeta;
    use tempfile::TempDir;

    fn stores() -> (TempDir, Vec<Box<dyn KvStore>>) {
        let temp = TempDir::new().unwrap();
        let dir = DirStore::open(temp.path().join("db")).unwrap();
        (temp, vec![Box::new(MemoryStore::new()), Box::new(dir)])
    }

    #[test]
    fn test_kv_basics() {
        let (_temp, stores) = stores();
        for kv in stores {
            assert_eq!(kv.get("plugins", "akismet").unwrap(), None);
            kv.put("plugins", "akismet", b"one").unwrap();
            kv.put("plugins", "hello-dolly", b"two").unwrap();
            kv.put("plugins", "akismet", b"three").unwrap();
            assert_eq!(kv.get("plugins", "akismet").unwrap(), Some(b"three".to_vec()));

            let keys: Vec<String> = kv.scan("plugins").unwrap().into_iter().map(|(k, _)| k).collect();
            assert_eq!(keys, vec!["akismet", "hello-dolly"]);

            kv.delete("plugins", "akismet").unwrap();
            kv.delete("plugins", "akismet").unwrap();
            assert_eq!(kv.scan("plugins").unwrap().len(), 1);

            kv.delete_bucket("plugins").unwrap();
            assert!(kv.scan("plugins").unwrap().is_empty());
            assert!(kv.scan("never-written").unwrap().is_empty());
        }
    }

    #[test]
    fn test_dir_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = DirStore::open(temp.path()).unwrap();
            store.put("repos", "plugins", b"1234").unwrap();
        }
        let store = DirStore::open(temp.path()).unwrap();
        assert_eq!(store.get("repos", "plugins").unwrap(), Some(b"1234".to_vec()));
    }

    #[test]
    fn test_dir_store_concurrent_writers() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::open(temp.path()).unwrap();

        std::thread::scope(|scope| {
            for t in 0..8u8 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..100u8 {
                        store.put("repos", "plugins", &[t, i]).unwrap();
                    }
                });
            }
        });

        let entries = store.scan("repos").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "plugins");
        assert_eq!(entries[0].1.len(), 2);
        assert_eq!(fs::read_dir(temp.path().join("repos")).unwrap().count(), 1);
    }

    #[test]
    fn test_dir_store_long_keys() {
        let temp = TempDir::new().unwrap();
        let store = DirStore::open(temp.path()).unwrap();
        let long = "a".repeat(300);
        let other = format!("{}b", "a".repeat(299));

        store.put("searches", &long, b"first").unwrap();
        store.put("searches", &other, b"second").unwrap();
        store.put("searches", "short", b"third").unwrap();
        assert_eq!(store.get("searches", &long).unwrap(), Some(b"first".to_vec()));
        assert_eq!(store.get("searches", &other).unwrap(), Some(b"second".to_vec()));

        for entry in fs::read_dir(temp.path().join("searches")).unwrap() {
            assert!(entry.unwrap().file_name().len() < 255);
        }

        let keys: Vec<String> = store.scan("searches").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![long.clone(), other.clone(), "short".to_string()]);

        store.delete("searches", &long).unwrap();
        assert_eq!(store.get("searches", &long).unwrap(), None);
        assert_eq!(store.scan("searches").unwrap().len(), 2);
    }

    #[test]
    fn test_dir_store_open_on_file_fails() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            DirStore::open(&file),
            Err(WpdirError::StoreUnavailable { .. })
        ));
    }

    #[test]
    fn test_blob_detects_corruption() {
        let summary = Summary::default();
        let mut blob = encode_blob(&summary).unwrap();
        let decoded: Summary = decode_blob("k", &blob).unwrap();
        assert_eq!(decoded, summary);

        blob[0] ^= 0xff;
        assert!(matches!(
            decode_blob::<Summary>("k", &blob),
            Err(WpdirError::Corrupted { .. })
        ));
        assert!(matches!(
            decode_blob::<Summary>("k", b"abc"),
            Err(WpdirError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_revision_persistence() {
        let store = ResultStore::in_memory();
        assert_eq!(store.load_revision(CorpusKind::Plugins).unwrap(), None);
        store.save_revision(CorpusKind::Plugins, 1_234_567).unwrap();
        assert_eq!(store.load_revision(CorpusKind::Plugins).unwrap(), Some(1_234_567));
        assert_eq!(
            store.kv().get(REPOS_BUCKET, "plugins").unwrap(),
            Some(b"1234567".to_vec())
        );

        store.kv().put(REPOS_BUCKET, "themes", b"abc").unwrap();
        assert!(store.load_revision(CorpusKind::Themes).is_err());
    }

    #[test]
    fn test_packages_skip_malformed() {
        let store = ResultStore::in_memory();
        let package = StoredPackage {
            slug: "akismet".to_string(),
            meta: PackageMeta {
                name: "Akismet".to_string(),
                ..Default::default()
            },
            revision: 10,
            stats: None,
        };
        store.save_package(CorpusKind::Plugins, &package).unwrap();
        store.kv().put("plugins", "broken", b"{not json").unwrap();

        let loaded = store.load_packages(CorpusKind::Plugins).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].meta.name, "Akismet");
        assert!(store.load_packages(CorpusKind::Themes).unwrap().is_empty());
    }

    #[test]
    fn test_search_history() {
        let temp = TempDir::new().unwrap();
        let store = ResultStore::open_dir(temp.path()).unwrap();

        let mut ids = Vec::new();
        for (i, private) in [false, true, false].into_iter().enumerate() {
            let request = SearchRequest::new(format!("p{}", i), CorpusKind::Plugins).private(private);
            let mut search = Search::new(format!("id{}", i), request);
            search.start(1);
            search.started = search
                .started
                .map(|t| t + chrono::Duration::seconds(i as i64));
            search.complete(i as u64);
            store.save_search(&search).unwrap();
            ids.push(search.id.clone());
        }

        let mut matches = Matches::default();
        matches.list.insert(
            "akismet".to_string(),
            vec![Match {
                slug: "akismet".to_string(),
                file: "akismet.php".to_string(),
                line_num: 3,
                line_text: "add_action".to_string(),
            }],
        );
        store.save_matches("id0", &matches).unwrap();
        assert_eq!(store.load_matches("id0").unwrap(), Some(matches));
        assert_eq!(store.load_summary("id0").unwrap(), None);

        let latest: Vec<String> = store
            .latest_public(10)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(latest, vec!["id2", "id0"]);
        assert_eq!(store.latest_public(1).unwrap().len(), 1);
        assert!(store.load_search("id1").unwrap().is_some());

        store.clear_searches().unwrap();
        assert!(store.load_search("id0").unwrap().is_none());
        assert!(store.latest_public(10).unwrap().is_empty());
    }
}
