//! Pack directory scanning and the `PackList` snapshot.
//!
//! The pack half of an `ObjectDatabase` is an immutable, atomically-swapped
//! list of open packs. Readers take a clone of the current `Arc<PackList>`
//! and never block behind a rescan in progress; a rescan simply publishes a
//! new snapshot when it finishes.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use git_pack::pack::{PackFile, PackState};
use git_pack::window::WindowCache;

use crate::OdbError;

/// A point-in-time view of the packs in one `objects/pack` directory.
pub struct PackList {
    pub(crate) packs: Vec<Arc<PackFile>>,
    /// Wall-clock time this snapshot was produced.
    pub(crate) last_read: SystemTime,
    /// Directory mtime observed at scan time.
    pub(crate) last_modified: SystemTime,
}

impl PackList {
    fn empty(now: SystemTime) -> Self {
        Self {
            packs: Vec::new(),
            last_read: now,
            last_modified: now,
        }
    }

    pub fn packs(&self) -> &[Arc<PackFile>] {
        &self.packs
    }
}

/// Scan `pack_dir` for `pack-*.idx`/`pack-*.pack` pairs, reusing handles from
/// `reuse` (by basename) when they are still valid.
///
/// Implements SPEC_FULL §4.G `scan_packs`: snapshot the listing, discard
/// dangling indexes, reuse-or-open each surviving pair, close handles that
/// were not reused, sort by the pack comparator (mtime desc, then name desc).
pub(crate) fn scan_packs(
    pack_dir: &Path,
    reuse: Option<&PackList>,
    windows: &Arc<WindowCache>,
) -> Result<PackList, OdbError> {
    let now = SystemTime::now();

    if !pack_dir.is_dir() {
        return Ok(PackList::empty(now));
    }

    let dir_mtime = fs::metadata(pack_dir)?.modified().unwrap_or(now);

    let entries: Vec<_> = fs::read_dir(pack_dir)?.filter_map(|e| e.ok()).collect();

    let mut basenames = HashSet::new();
    let mut pairs = Vec::new();
    for entry in &entries {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "idx") {
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if !stem.starts_with("pack-") || !basenames.insert(stem.clone()) {
                continue;
            }
            let pack_path = path.with_extension("pack");
            if pack_path.is_file() {
                pairs.push((pack_path, stem));
            }
            // Dangling index (no matching .pack): silently discarded.
        }
    }

    let mut reused_basenames = HashSet::new();
    let mut packs = Vec::with_capacity(pairs.len());
    for (pack_path, basename) in &pairs {
        let existing = reuse.and_then(|old| {
            old.packs
                .iter()
                .find(|p| p.basename() == *basename && p.state() != PackState::Invalid)
        });
        if let Some(pack) = existing {
            reused_basenames.insert(basename.clone());
            packs.push(Arc::clone(pack));
            continue;
        }
        match PackFile::open_with_cache(pack_path, Arc::clone(windows)) {
            Ok(pack) => packs.push(Arc::new(pack)),
            Err(_) => continue, // Corrupt pack: skip, fall back to other sources.
        }
    }

    if let Some(old) = reuse {
        for pack in &old.packs {
            if !reused_basenames.contains(pack.basename().as_ref()) {
                pack.close();
            }
        }
    }

    packs.sort_by(|a, b| b.mtime().cmp(&a.mtime()).then_with(|| b.basename().cmp(&a.basename())));

    Ok(PackList {
        packs,
        last_read: now,
        last_modified: dir_mtime,
    })
}

/// Whether `snapshot` must be rescanned given the directory's current mtime.
///
/// A snapshot is "racy clean" while `now - last_modified <= racy_window`; a
/// racy snapshot is rescanned even if the directory mtime hasn't visibly
/// changed, since a second write within the same mtime tick would otherwise
/// be invisible (SPEC_FULL §4.G Raciness defense).
pub(crate) fn needs_rescan(
    snapshot: &PackList,
    current_dir_mtime: SystemTime,
    now: SystemTime,
    racy_window: std::time::Duration,
) -> bool {
    if current_dir_mtime != snapshot.last_modified {
        return true;
    }
    now.duration_since(snapshot.last_modified)
        .map(|elapsed| elapsed <= racy_window)
        .unwrap_or(true)
}
