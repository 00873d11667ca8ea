pub(crate) mod loose;
pub mod packed;
pub(crate) mod transaction;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use git_hash::ObjectId;
use git_utils::date::Signature;

use crate::error::RefError;
use crate::name::RefName;
use crate::reflog::{self, ReflogEntry};
use crate::store::{RefStore, RefTransaction};
use crate::Reference;

use self::packed::PackedRefs;

/// Maximum depth for following symbolic ref chains. A chain deeper than this
/// resolves to `None` rather than erroring — the same fail-soft bound
/// git-odb applies to alternates depth, since a ref store has no good way
/// to distinguish a true cycle from a merely long chain.
pub(crate) const MAX_SYMREF_DEPTH: usize = 5;

/// Prefixes tried, in order, when resolving a short name via `get`.
const SHORT_NAME_SEARCH_ORDER: &[&str] = &["", "refs/", "refs/tags/", "refs/heads/", "refs/remotes/"];

/// Tunables for a `FilesRefStore`, supplied as constructor parameters with a
/// `Default` impl rather than parsed git config (see `git_odb::OdbOptions`
/// for the same convention on the object side).
#[derive(Debug, Clone, Copy)]
pub struct RefDirectoryOptions {
    /// Mirrors `core.logAllRefUpdates`: when true, every update is appended
    /// to its ref's reflog. When false, only the refs git auto-logs by name
    /// (`HEAD`, `refs/heads/*`, `refs/remotes/*`, `refs/stash`) are logged.
    pub log_all_ref_updates: bool,
}

impl Default for RefDirectoryOptions {
    fn default() -> Self {
        Self {
            log_all_ref_updates: true,
        }
    }
}

/// In-memory snapshot of packed-refs, valid as long as the file's mtime and
/// length match what we last loaded.
struct PackedSnapshot {
    refs: Arc<PackedRefs>,
    mtime: Option<SystemTime>,
    len: u64,
}

/// In-memory snapshot of the loose-ref directory listing, valid as long as
/// no mutating operation has run on this store since it was built.
struct LooseSnapshot {
    refs: Arc<Vec<(RefName, PathBuf)>>,
    built_at: u64,
}

/// Files-backend ref store (loose refs + packed-refs).
///
/// This is the default ref backend matching C git's files backend:
/// - Loose refs stored as individual files under `.git/refs/`
/// - Packed refs in `.git/packed-refs` for efficiency
/// - Loose refs take precedence over packed refs
/// - Lock files for atomic updates
pub struct FilesRefStore {
    git_dir: PathBuf,
    committer: Option<Signature>,
    odb: Option<Arc<git_odb::ObjectDatabase>>,
    options: RefDirectoryOptions,
    packed: RwLock<PackedSnapshot>,
    loose_cache: RwLock<LooseSnapshot>,
    mod_count: AtomicU64,
    peel_cache: Mutex<HashMap<RefName, (ObjectId, ObjectId)>>,
}

impl FilesRefStore {
    /// Create a new files-based ref store with default options.
    pub fn new(git_dir: impl AsRef<Path>) -> Self {
        Self::with_options(git_dir, RefDirectoryOptions::default())
    }

    /// Create a new files-based ref store with explicit options.
    pub fn with_options(git_dir: impl AsRef<Path>, options: RefDirectoryOptions) -> Self {
        Self {
            git_dir: git_dir.as_ref().to_path_buf(),
            committer: None,
            odb: None,
            options,
            packed: RwLock::new(PackedSnapshot {
                refs: Arc::new(PackedRefs::empty()),
                mtime: None,
                len: 0,
            }),
            loose_cache: RwLock::new(LooseSnapshot {
                refs: Arc::new(Vec::new()),
                built_at: u64::MAX,
            }),
            mod_count: AtomicU64::new(0),
            peel_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Set the committer identity used for reflog entries.
    pub fn set_committer(&mut self, sig: Signature) {
        self.committer = Some(sig);
    }

    /// Attach an object database, enabling `peel`.
    pub fn set_object_database(&mut self, odb: Arc<git_odb::ObjectDatabase>) {
        self.odb = Some(odb);
    }

    /// Get the git directory path.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Counter bumped after every successful mutating operation on this
    /// store. Used internally to invalidate the loose-ref listing cache.
    pub fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    fn bump_mod_count(&self) -> u64 {
        self.mod_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn packed_refs_current(&self) -> Result<Arc<PackedRefs>, RefError> {
        let path = packed::packed_refs_path(&self.git_dir);
        let meta = std::fs::metadata(&path).ok();
        let mtime = meta.as_ref().and_then(|m| m.modified().ok());
        let len = meta.map(|m| m.len()).unwrap_or(0);

        {
            let snap = self.packed.read().unwrap();
            if snap.mtime == mtime && snap.len == len {
                return Ok(Arc::clone(&snap.refs));
            }
        }

        let fresh = Arc::new(PackedRefs::load(&self.git_dir)?);
        let mut snap = self.packed.write().unwrap();
        *snap = PackedSnapshot {
            refs: Arc::clone(&fresh),
            mtime,
            len,
        };
        Ok(fresh)
    }

    fn loose_refs_current(&self) -> Result<Arc<Vec<(RefName, PathBuf)>>, RefError> {
        let current_mod = self.mod_count();
        {
            let snap = self.loose_cache.read().unwrap();
            if snap.built_at == current_mod {
                return Ok(Arc::clone(&snap.refs));
            }
        }

        let fresh = Arc::new(loose::enumerate_loose_refs(&self.git_dir, None)?);
        let mut snap = self.loose_cache.write().unwrap();
        *snap = LooseSnapshot {
            refs: Arc::clone(&fresh),
            built_at: current_mod,
        };
        Ok(fresh)
    }

    /// Resolve a ref name, following symbolic ref chains up to MAX_SYMREF_DEPTH.
    /// A chain that doesn't bottom out within the bound yields `None`.
    fn resolve_inner(&self, name: &RefName, depth: usize) -> Result<Option<ObjectId>, RefError> {
        match loose::read_loose_ref(&self.git_dir, name)? {
            Some(Reference::Direct { target, .. }) => Ok(Some(target)),
            Some(Reference::Symbolic { target, .. }) => {
                if depth + 1 >= MAX_SYMREF_DEPTH {
                    return Ok(None);
                }
                self.resolve_inner(&target, depth + 1)
            }
            None => {
                let packed = self.packed_refs_current()?;
                Ok(packed.find(name).map(|pr| pr.oid))
            }
        }
    }

    /// Resolve a short name (e.g. `main`) by trying the same prefixes
    /// `git rev-parse --verify` does, in order: as given, then `refs/`,
    /// `refs/tags/`, `refs/heads/`, `refs/remotes/`.
    pub fn get(&self, short_name: &str) -> Result<Option<Reference>, RefError> {
        for prefix in SHORT_NAME_SEARCH_ORDER {
            let candidate = format!("{prefix}{short_name}");
            if let Ok(name) = RefName::new(candidate) {
                if let Some(r) = self.resolve(&name)? {
                    return Ok(Some(r));
                }
            }
        }
        Ok(None)
    }

    /// Check whether creating `name` would collide with an existing ref
    /// along a directory/file boundary, without writing anything.
    pub fn check_name_conflict(&self, name: &RefName) -> Result<(), RefError> {
        loose::check_dir_file_conflict(&self.git_dir, name)
    }

    /// Write a single ref directly (non-transactional, no CAS check).
    pub fn write_ref(&self, name: &RefName, oid: &ObjectId) -> Result<(), RefError> {
        loose::write_loose_ref(&self.git_dir, name, oid)?;
        self.bump_mod_count();
        Ok(())
    }

    /// Write a symbolic ref directly (non-transactional).
    pub fn write_symbolic_ref(&self, name: &RefName, target: &RefName) -> Result<(), RefError> {
        loose::write_symbolic_ref(&self.git_dir, name, target)?;
        self.bump_mod_count();
        Ok(())
    }

    /// Delete a ref directly (non-transactional).
    pub fn delete_ref(&self, name: &RefName) -> Result<(), RefError> {
        loose::delete_loose_ref(&self.git_dir, name)?;
        self.bump_mod_count();
        Ok(())
    }

    /// Commit a transaction atomically.
    pub fn commit_transaction(&self, transaction: RefTransaction) -> Result<(), RefError> {
        if transaction.is_empty() {
            return Ok(());
        }
        transaction::commit_transaction(
            &self.git_dir,
            transaction,
            self.committer.as_ref(),
            &self.options,
        )?;
        self.bump_mod_count();
        Ok(())
    }

    /// Current packed-refs contents.
    pub fn packed_refs(&self) -> Result<Arc<PackedRefs>, RefError> {
        self.packed_refs_current()
    }

    /// Pack a loose ref into packed-refs and remove the loose file.
    pub fn pack_ref(&self, name: &RefName) -> Result<(), RefError> {
        let oid = match loose::read_loose_ref(&self.git_dir, name)? {
            Some(Reference::Direct { target, .. }) => target,
            Some(Reference::Symbolic { .. }) => {
                return Err(RefError::PackedRefs("cannot pack symbolic ref".into()));
            }
            None => return Err(RefError::NotFound(name.to_string())),
        };

        let mut packed = (*self.packed_refs_current()?).clone();
        packed.upsert(name.clone(), oid, None);
        packed.write(&self.git_dir)?;
        loose::delete_loose_ref(&self.git_dir, name)?;
        self.bump_mod_count();
        let _ = self.packed_refs_current();
        Ok(())
    }

    /// Resolve `name` and, if it points at an annotated tag, walk the tag
    /// chain down to the first non-tag object. A second call for a ref whose
    /// resolved OID hasn't changed is served from an in-memory cache instead
    /// of re-reading the tag chain.
    pub fn peel(&self, name: &RefName) -> Result<Option<ObjectId>, RefError> {
        let Some(odb) = self.odb.as_ref() else {
            return Ok(None);
        };
        let Some(oid) = self.resolve_to_oid(name)? else {
            return Ok(None);
        };

        if let Some((cached_oid, peeled)) = self.peel_cache.lock().unwrap().get(name) {
            if *cached_oid == oid {
                return Ok(Some(*peeled));
            }
        }

        let mut current = oid;
        let peeled = loop {
            match odb.read(&current)? {
                Some(git_object::Object::Tag(tag)) => current = tag.target,
                Some(_) => break current,
                None => return Ok(None),
            }
        };

        self.peel_cache.lock().unwrap().insert(name.clone(), (oid, peeled));
        Ok(Some(peeled))
    }
}

impl RefStore for FilesRefStore {
    fn resolve(&self, name: &RefName) -> Result<Option<Reference>, RefError> {
        // Check loose ref first
        match loose::read_loose_ref(&self.git_dir, name)? {
            Some(r) => Ok(Some(r)),
            None => {
                // Fall back to packed refs
                let packed = self.packed_refs_current()?;
                Ok(packed.find(name).map(|pr| Reference::Direct {
                    name: pr.name.clone(),
                    target: pr.oid,
                }))
            }
        }
    }

    fn resolve_to_oid(&self, name: &RefName) -> Result<Option<ObjectId>, RefError> {
        self.resolve_inner(name, 0)
    }

    fn iter(
        &self,
        prefix: Option<&str>,
    ) -> Result<Box<dyn Iterator<Item = Result<Reference, RefError>> + '_>, RefError> {
        // Collect all loose refs
        let loose_refs = self.loose_refs_current()?;
        let mut loose_names: std::collections::HashSet<String> = std::collections::HashSet::new();

        let mut all_refs: Vec<Result<Reference, RefError>> = Vec::new();

        for (name, _path) in loose_refs.iter() {
            if let Some(p) = prefix {
                if !name.as_str().starts_with(p) {
                    continue;
                }
            }
            loose_names.insert(name.as_str().to_string());
            match loose::read_loose_ref(&self.git_dir, name) {
                Ok(Some(r)) => all_refs.push(Ok(r)),
                Ok(None) => {} // File may have been deleted between enumerate and read
                Err(e) => all_refs.push(Err(e)),
            }
        }

        // Add packed refs that aren't overridden by loose refs
        let packed = self.packed_refs_current()?;
        for pr in packed.refs() {
            if loose_names.contains(pr.name.as_str()) {
                continue; // Loose ref takes precedence
            }
            if let Some(p) = prefix {
                if !pr.name.as_str().starts_with(p) {
                    continue;
                }
            }
            all_refs.push(Ok(Reference::Direct {
                name: pr.name.clone(),
                target: pr.oid,
            }));
        }

        // Sort by ref name
        all_refs.sort_by(|a, b| {
            let name_a = match a {
                Ok(r) => r.name().clone(),
                Err(_) => RefName::new_unchecked(""),
            };
            let name_b = match b {
                Ok(r) => r.name().clone(),
                Err(_) => RefName::new_unchecked(""),
            };
            name_a.cmp(&name_b)
        });

        Ok(Box::new(all_refs.into_iter()))
    }

    fn reflog(&self, name: &RefName) -> Result<Vec<ReflogEntry>, RefError> {
        reflog::read_reflog(&self.git_dir, name)
    }

    fn append_reflog(&self, name: &RefName, entry: &ReflogEntry) -> Result<(), RefError> {
        reflog::append_reflog_entry(&self.git_dir, name, entry)
    }
}
