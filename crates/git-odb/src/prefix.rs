//! OID prefix resolution (short hex -> full OID with ambiguity detection).
//!
//! Searches packs then loose objects, self then alternates, collecting every
//! match via `git_hash::AbbreviatedObjectId` so odd-length prefixes compare
//! correctly against half a byte.

use git_hash::{AbbreviatedObjectId, ObjectId, MINIMUM_ABBREV};

use crate::{ObjectDatabase, OdbError};

/// Resolve a hex prefix to a full OID.
///
/// Returns an error if the prefix is ambiguous (matches multiple distinct
/// objects), too short, or matches nothing.
pub fn resolve_prefix(odb: &ObjectDatabase, prefix: &str) -> Result<ObjectId, OdbError> {
    if prefix.len() < MINIMUM_ABBREV {
        return Err(OdbError::Ambiguous {
            prefix: prefix.to_string(),
            count: 0,
        });
    }

    if prefix.len() == ObjectId::LEN * 2 {
        if let Ok(oid) = ObjectId::from_hex(prefix) {
            return if odb.contains(&oid) {
                Ok(oid)
            } else {
                Err(OdbError::NotFound(oid))
            };
        }
    }

    let abbrev = AbbreviatedObjectId::from_hex(prefix)
        .map_err(|_| OdbError::NotFound(ObjectId::NULL))?;

    let mut matches = Vec::new();
    collect_matches(odb, &abbrev, &mut matches);
    matches.sort();
    matches.dedup();

    match matches.len() {
        0 => Err(OdbError::NotFound(ObjectId::NULL)),
        1 => Ok(matches[0]),
        n => Err(OdbError::Ambiguous {
            prefix: prefix.to_string(),
            count: n,
        }),
    }
}

fn collect_matches(odb: &ObjectDatabase, abbrev: &AbbreviatedObjectId, out: &mut Vec<ObjectId>) {
    {
        let snapshot = odb.ensure_current_packs();
        for pack in snapshot.packs() {
            pack.index().resolve(abbrev, usize::MAX, out);
        }
    }
    if let Ok(iter) = odb.loose().iter() {
        for result in iter.flatten() {
            if abbrev.matches(&result) {
                out.push(result);
            }
        }
    }
    for alt in odb.alternates() {
        collect_matches(alt, abbrev, out);
    }
}
