//! Unified object database for git.
//!
//! Provides a single interface to read and write objects across loose
//! storage, packfiles, and alternate object databases. This is the primary
//! abstraction that all higher-level git operations use to access objects.

pub mod alternates;
pub mod backend;
pub(crate) mod packs;
pub mod prefix;
mod search;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, SystemTime};

use git_hash::ObjectId;
use git_loose::LooseObjectStore;
use git_object::cache::ObjectCache;
use git_object::{Object, ObjectType};
use git_pack::pack::PackFile;
use git_pack::window::WindowCache;
use lru::LruCache;

pub use alternates::AlternatesDiagnostics;
pub use backend::OdbBackend;
pub use error::OdbError;

use packs::PackList;

mod error {
    use git_hash::ObjectId;

    #[derive(Debug, thiserror::Error)]
    pub enum OdbError {
        #[error("object not found: {0}")]
        NotFound(ObjectId),

        #[error("ambiguous object name: {prefix} matches {count} objects")]
        Ambiguous { prefix: String, count: usize },

        #[error("corrupt object {oid}: {reason}")]
        Corrupt { oid: ObjectId, reason: String },

        #[error(transparent)]
        Loose(#[from] git_loose::LooseError),

        #[error(transparent)]
        Pack(#[from] git_pack::PackError),

        #[error(transparent)]
        Io(#[from] std::io::Error),
    }
}

/// Lightweight object info (header only, no content).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub obj_type: ObjectType,
    pub size: usize,
}

/// Outcome of `insert_unpacked` (SPEC_FULL §4.G Insertion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Object was newly written.
    Inserted,
    /// Object already existed as a loose object; the write was a no-op.
    ExistsLoose,
    /// Object already existed in a pack; the write was a no-op.
    ExistsPacked,
}

/// Tunable constants, exposed as constructor parameters rather than parsed
/// from a config file (see SPEC_FULL §2 Ambient stack: config parsing is
/// out of scope for this core).
#[derive(Debug, Clone)]
pub struct OdbOptions {
    /// Window within which a pack directory scan is considered "racy" and
    /// re-scanned even if its mtime hasn't visibly changed. Default 120s.
    pub racy_clean_window: Duration,
    /// Capacity of the parsed-object LRU cache used by `read_cached`.
    pub cache_capacity: usize,
    /// Capacity of the positive-hit loose-object existence cache.
    pub unpacked_cache_capacity: usize,
    /// Byte budget handed to this database's `WindowCache`.
    pub window_cache_bytes: u64,
}

impl Default for OdbOptions {
    fn default() -> Self {
        Self {
            racy_clean_window: Duration::from_secs(120),
            cache_capacity: 1024,
            unpacked_cache_capacity: 1024,
            window_cache_bytes: git_pack::window::DEFAULT_BYTE_BUDGET,
        }
    }
}

/// Positive-hit fast path: recently confirmed-present loose object ids.
///
/// Per SPEC_FULL §4.G: "a bounded set of recently observed loose-object ids
/// used as a positive-hit fast path; when an insertion or read confirms
/// existence, the id is added; when a not-found is observed, the id is
/// removed."
struct UnpackedObjectCache {
    cache: LruCache<ObjectId, ()>,
}

impl UnpackedObjectCache {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            cache: LruCache::new(capacity),
        }
    }

    fn contains(&self, oid: &ObjectId) -> bool {
        self.cache.contains(oid)
    }

    fn mark_present(&mut self, oid: ObjectId) {
        self.cache.put(oid, ());
    }

    fn mark_absent(&mut self, oid: &ObjectId) {
        self.cache.pop(oid);
    }
}

/// Unified object database providing access across all storage backends.
pub struct ObjectDatabase {
    /// Loose object store.
    loose: LooseObjectStore,
    /// Current pack-directory snapshot, published under a swap lock.
    packs: RwLock<Arc<PackList>>,
    /// Byte-budget window cache shared by every pack opened by this database.
    windows: Arc<WindowCache>,
    /// Lazily initialized alternates, built from `info/alternates`.
    alternates: OnceLock<Vec<ObjectDatabase>>,
    /// Accumulates alternates that failed to open (never surfaced as an error).
    alternates_diagnostics: AlternatesDiagnostics,
    /// How many alternate-hops this database is from the root (0 = root).
    depth: usize,
    /// Positive-hit loose-object existence cache.
    unpacked_cache: Mutex<UnpackedObjectCache>,
    /// Parsed-object cache used by `read_cached`.
    cache: Mutex<ObjectCache>,
    /// Path to the objects directory.
    objects_dir: PathBuf,
    options: OdbOptions,
}

impl ObjectDatabase {
    /// Open the object database at the given objects directory, with default options.
    pub fn open(objects_dir: impl AsRef<Path>) -> Result<Self, OdbError> {
        Self::open_with_options(objects_dir, OdbOptions::default())
    }

    /// Open the object database with explicit options.
    pub fn open_with_options(
        objects_dir: impl AsRef<Path>,
        options: OdbOptions,
    ) -> Result<Self, OdbError> {
        Self::open_nested(objects_dir.as_ref(), options, 0)
    }

    pub(crate) fn open_nested(
        objects_dir: &Path,
        options: OdbOptions,
        depth: usize,
    ) -> Result<Self, OdbError> {
        let objects_dir = objects_dir.to_path_buf();
        let loose = LooseObjectStore::open(&objects_dir);
        let windows = Arc::new(WindowCache::new(options.window_cache_bytes));
        let pack_list = packs::scan_packs(&objects_dir.join("pack"), None, &windows)?;

        Ok(Self {
            loose,
            packs: RwLock::new(Arc::new(pack_list)),
            windows,
            alternates: OnceLock::new(),
            alternates_diagnostics: AlternatesDiagnostics::default(),
            depth,
            unpacked_cache: Mutex::new(UnpackedObjectCache::new(options.unpacked_cache_capacity)),
            cache: Mutex::new(ObjectCache::new(options.cache_capacity)),
            objects_dir,
            options,
        })
    }

    /// Read an object by OID (two-phase: packs then loose, self then alternates).
    pub fn read(&self, oid: &ObjectId) -> Result<Option<Object>, OdbError> {
        search::find_object(self, oid)
    }

    /// Read an object with caching.
    pub fn read_cached(&self, oid: &ObjectId) -> Result<Option<Object>, OdbError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(obj) = cache.get(oid) {
                return Ok(Some(obj.clone()));
            }
        }

        let obj = self.read(oid)?;

        if let Some(ref obj) = obj {
            let mut cache = self.cache.lock().unwrap();
            cache.insert(*oid, obj.clone());
        }

        Ok(obj)
    }

    /// Read just the header (type + size) without full content.
    pub fn read_header(&self, oid: &ObjectId) -> Result<Option<ObjectInfo>, OdbError> {
        search::find_header(self, oid)
    }

    /// Check if an object exists (fast, no decompression for packed objects).
    pub fn contains(&self, oid: &ObjectId) -> bool {
        search::object_exists(self, oid)
    }

    /// Write a new object (always to loose store). Idempotent.
    pub fn write(&self, obj: &Object) -> Result<ObjectId, OdbError> {
        let oid = self.loose.write(obj)?;
        self.mark_loose_present(oid);
        Ok(oid)
    }

    /// Write raw content with type (always to loose store). Idempotent.
    pub fn write_raw(&self, obj_type: ObjectType, content: &[u8]) -> Result<ObjectId, OdbError> {
        let oid = self.loose.write_raw(obj_type, content)?;
        self.mark_loose_present(oid);
        Ok(oid)
    }

    /// Insert a loose object, returning whether it was newly written or
    /// already present (SPEC_FULL §4.G Insertion, §3 invariant 6).
    ///
    /// A no-op write still returns a definitive outcome so callers (e.g. a
    /// pack-stream inserter building a thin pack) know whether to skip
    /// re-sending the object.
    ///
    /// `create_duplicate=false` treats a packed hit as blocking, same as a
    /// loose hit. `create_duplicate=true` writes a fresh loose copy anyway
    /// (a caller that needs its own loose copy of an already-packed object,
    /// e.g. before a destructive repack) even though the id is already
    /// reachable via a pack. A loose hit is always a no-op regardless of the
    /// flag — the object is already present in exactly the form this call
    /// would produce.
    pub fn insert_unpacked(
        &self,
        obj_type: ObjectType,
        content: &[u8],
        create_duplicate: bool,
    ) -> Result<(ObjectId, InsertOutcome), OdbError> {
        let oid = git_hash::hasher::Hasher::hash_object(
            std::str::from_utf8(obj_type.as_bytes()).unwrap(),
            content,
        )
        .map_err(|e| OdbError::Corrupt {
            oid: ObjectId::NULL,
            reason: e.to_string(),
        })?;

        if self.loose_cache_contains(&oid) || self.loose.contains(&oid) {
            return Ok((oid, InsertOutcome::ExistsLoose));
        }
        if !create_duplicate && packs_contain_direct(self, &oid) {
            self.mark_loose_present(oid);
            return Ok((oid, InsertOutcome::ExistsPacked));
        }

        let written = self.loose.write_raw(obj_type, content)?;
        debug_assert_eq!(written, oid);
        self.mark_loose_present(oid);
        Ok((oid, InsertOutcome::Inserted))
    }

    /// Resolve an OID prefix to a full OID.
    /// Returns an error if the prefix is ambiguous.
    pub fn resolve_prefix(&self, prefix: &str) -> Result<ObjectId, OdbError> {
        prefix::resolve_prefix(self, prefix)
    }

    /// Force a rescan of the pack directory regardless of racy-clean state.
    pub fn refresh(&self) -> Result<(), OdbError> {
        self.force_rescan_packs()?;
        Ok(())
    }

    /// Every alternate failure recorded while opening or querying this
    /// database or its (already-loaded) alternates.
    pub fn alternates_diagnostics(&self) -> &AlternatesDiagnostics {
        &self.alternates_diagnostics
    }

    /// Iterate over all known object OIDs (for fsck/gc).
    pub fn iter_all_oids(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<ObjectId, OdbError>> + '_>, OdbError> {
        let loose_iter = self.loose.iter()?.map(|r| r.map_err(OdbError::from));

        let snapshot = self.ensure_current_packs();
        let mut pack_oids: Vec<Result<ObjectId, OdbError>> = Vec::new();
        for pack in snapshot.packs() {
            for (oid, _offset) in pack.index().iter() {
                pack_oids.push(Ok(oid));
            }
        }

        let alt_oids: Vec<Result<ObjectId, OdbError>> = self
            .alternates()
            .iter()
            .flat_map(|alt| match alt.iter_all_oids() {
                Ok(iter) => iter.collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            })
            .collect();

        Ok(Box::new(loose_iter.chain(pack_oids).chain(alt_oids)))
    }

    /// Get the path to the objects directory.
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Lazily loaded alternates array.
    pub(crate) fn alternates(&self) -> &[ObjectDatabase] {
        self.alternates
            .get_or_init(|| {
                alternates::build_alternate_list(
                    &self.objects_dir,
                    &self.options,
                    &self.alternates_diagnostics,
                    self.depth + 1,
                )
            })
            .as_slice()
    }

    pub(crate) fn loose_cache_contains(&self, oid: &ObjectId) -> bool {
        self.unpacked_cache.lock().unwrap().contains(oid)
    }

    pub(crate) fn mark_loose_present(&self, oid: ObjectId) {
        self.unpacked_cache.lock().unwrap().mark_present(oid);
    }

    pub(crate) fn mark_loose_absent(&self, oid: &ObjectId) {
        self.unpacked_cache.lock().unwrap().mark_absent(oid);
    }

    pub(crate) fn loose(&self) -> &LooseObjectStore {
        &self.loose
    }

    /// Current pack snapshot, rescanning first if it is stale or racy
    /// (SPEC_FULL §4.G Raciness defense).
    pub(crate) fn ensure_current_packs(&self) -> Arc<PackList> {
        let current = Arc::clone(&self.packs.read().unwrap());
        let pack_dir = self.objects_dir.join("pack");
        let dir_mtime = std::fs::metadata(&pack_dir)
            .and_then(|m| m.modified())
            .unwrap_or(current.last_modified);
        let now = SystemTime::now();

        if !packs::needs_rescan(&current, dir_mtime, now, self.options.racy_clean_window) {
            return current;
        }

        self.force_rescan_packs().unwrap_or(current)
    }

    /// Unconditionally rescan the pack directory and publish the new snapshot.
    pub(crate) fn force_rescan_packs(&self) -> Result<Arc<PackList>, OdbError> {
        let pack_dir = self.objects_dir.join("pack");
        let mut guard = self.packs.write().unwrap();
        let fresh = packs::scan_packs(&pack_dir, Some(&**guard), &self.windows)?;
        let fresh = Arc::new(fresh);
        *guard = Arc::clone(&fresh);
        Ok(fresh)
    }
}

/// Direct pack containment check used by `insert_unpacked` (no recursion into
/// alternates — a just-written object is never already packed upstream).
fn packs_contain_direct(odb: &ObjectDatabase, oid: &ObjectId) -> bool {
    odb.ensure_current_packs().packs().iter().any(|p: &Arc<PackFile>| p.contains(oid))
}
