//! Alternates file parsing and recursive loading.
//!
//! The file `.git/objects/info/alternates` contains one path per line,
//! pointing to other object directories. Each alternate is itself an object
//! store that may have its own alternates file (forming a chain). Cycles are
//! not actively detected — recursion is bounded by depth instead, on the
//! assumption that alternates form a DAG in practice (SPEC_FULL §3, §4.G).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{ObjectDatabase, OdbOptions};

/// Maximum depth for recursive alternates loading (matches C git).
pub(crate) const MAX_ALTERNATES_DEPTH: usize = 5;

/// Accumulates alternates that failed to open instead of surfacing an error.
///
/// Per SPEC_FULL §9 Open Question i: a transitively-referenced alternate that
/// fails to open never propagates out of `ObjectDatabase::open` or a query —
/// its entry is recorded here and substituted with an empty alternate list.
/// There is no logging/tracing dependency in this stack (§2 Ambient stack),
/// so this accumulator is the substitute for a log line.
#[derive(Debug, Default)]
pub struct AlternatesDiagnostics {
    skipped: Mutex<Vec<(PathBuf, String)>>,
}

impl AlternatesDiagnostics {
    pub fn record(&self, path: PathBuf, reason: impl Into<String>) {
        self.skipped.lock().unwrap().push((path, reason.into()));
    }

    /// Snapshot of every alternate that was skipped, with the reason.
    pub fn skipped(&self) -> Vec<(PathBuf, String)> {
        self.skipped.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.skipped.lock().unwrap().is_empty()
    }
}

/// Build the immediate alternates list for `objects_dir`, at the given depth
/// (the depth the *new* databases will be opened at). A failure to open any
/// one alternate is recorded in `diagnostics` and that entry is simply
/// omitted — it never turns into an `Err` for the caller.
pub(crate) fn build_alternate_list(
    objects_dir: &Path,
    options: &OdbOptions,
    diagnostics: &AlternatesDiagnostics,
    depth: usize,
) -> Vec<ObjectDatabase> {
    if depth >= MAX_ALTERNATES_DEPTH {
        diagnostics.record(
            objects_dir.to_path_buf(),
            format!("alternates chain too deep (>{MAX_ALTERNATES_DEPTH} levels)"),
        );
        return Vec::new();
    }

    let alternates_path = objects_dir.join("info").join("alternates");
    if !alternates_path.is_file() {
        return Vec::new();
    }

    let content = match fs::read_to_string(&alternates_path) {
        Ok(c) => c,
        Err(e) => {
            diagnostics.record(alternates_path, e.to_string());
            return Vec::new();
        }
    };

    let mut result = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let alt_path = if Path::new(line).is_absolute() {
            PathBuf::from(line)
        } else {
            objects_dir.join(line)
        };

        if !alt_path.is_dir() {
            diagnostics.record(alt_path, "alternate directory does not exist".into());
            continue;
        }

        match ObjectDatabase::open_nested(&alt_path, options.clone(), depth) {
            Ok(db) => result.push(db),
            Err(e) => diagnostics.record(alt_path, e.to_string()),
        }
    }

    result
}

/// Parse an alternates file and return the raw paths (for testing).
pub fn parse_alternates_file(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let base_dir = path.parent().and_then(|p| p.parent()).unwrap_or(path);

    Ok(content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            if Path::new(l).is_absolute() {
                PathBuf::from(l)
            } else {
                base_dir.join(l)
            }
        })
        .collect())
}
