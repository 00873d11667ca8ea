//! Pack index reading and lookup, supporting both v1 and v2 layouts.
//!
//! Version 2 format:
//!
//! ```text
//! Header:  \xff tOc (4 bytes) | version (4 bytes = 2)
//! Fanout:  256 × 4-byte big-endian cumulative counts
//! OIDs:    N × 20-byte sorted OIDs
//! CRC32:   N × 4-byte CRC32 values
//! Offsets: N × 4-byte offsets (high bit = 1 → use 64-bit table)
//! 64-bit:  M × 8-byte offsets (for packs > 2GB)
//! Trailer: 20-byte pack checksum | 20-byte index checksum
//! ```
//!
//! Version 1 has no magic/version header; it starts directly with the
//! fanout table, and each entry is a 4-byte offset immediately followed
//! by the 20-byte OID (no separate CRC32 table, no 64-bit overflow table).

use std::path::{Path, PathBuf};

use git_hash::{AbbreviatedObjectId, ObjectId};
use memmap2::Mmap;

use crate::{IDX_SIGNATURE, IDX_VERSION, PackError};

const HASH_LEN: usize = ObjectId::LEN;

enum Layout {
    V1,
    V2 {
        oid_offset: usize,
        crc_offset: usize,
        offset32_offset: usize,
        offset64_offset: usize,
    },
}

/// Pack index providing OID → offset mapping, v1 or v2.
pub struct PackIndex {
    data: Mmap,
    version: u32,
    num_objects: u32,
    fanout_offset: usize,
    layout: Layout,
    idx_path: PathBuf,
}

impl PackIndex {
    /// Open a pack index file, detecting v1 vs v2 from the magic bytes.
    pub fn open(idx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let idx_path = idx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&idx_path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < 1024 + 2 * HASH_LEN {
            return Err(PackError::InvalidIndex("file too small".into()));
        }

        let is_v2 = data.len() >= 8 && data[0..4] == IDX_SIGNATURE;

        if is_v2 {
            let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if version != IDX_VERSION {
                return Err(PackError::InvalidIndex(format!(
                    "unsupported version {version}, expected {IDX_VERSION}"
                )));
            }

            let fanout_offset = 8;
            let last_fanout_pos = fanout_offset + 255 * 4;
            let num_objects = u32::from_be_bytes([
                data[last_fanout_pos],
                data[last_fanout_pos + 1],
                data[last_fanout_pos + 2],
                data[last_fanout_pos + 3],
            ]);

            let n = num_objects as usize;
            let oid_offset = fanout_offset + 1024;
            let crc_offset = oid_offset + n * HASH_LEN;
            let offset32_offset = crc_offset + n * 4;
            let offset64_offset = offset32_offset + n * 4;

            let min_size = offset64_offset + 2 * HASH_LEN;
            if data.len() < min_size {
                return Err(PackError::InvalidIndex(format!(
                    "file too small: {} < {min_size}",
                    data.len()
                )));
            }

            Ok(Self {
                data,
                version,
                num_objects,
                fanout_offset,
                layout: Layout::V2 {
                    oid_offset,
                    crc_offset,
                    offset32_offset,
                    offset64_offset,
                },
                idx_path,
            })
        } else {
            // v1: fanout table starts at byte 0, no header.
            let fanout_offset = 0;
            let last_fanout_pos = fanout_offset + 255 * 4;
            let num_objects = u32::from_be_bytes([
                data[last_fanout_pos],
                data[last_fanout_pos + 1],
                data[last_fanout_pos + 2],
                data[last_fanout_pos + 3],
            ]);

            let n = num_objects as usize;
            let entries_offset = 1024;
            let min_size = entries_offset + n * (4 + HASH_LEN) + 2 * HASH_LEN;
            if data.len() < min_size {
                return Err(PackError::InvalidIndex(format!(
                    "file too small: {} < {min_size}",
                    data.len()
                )));
            }

            Ok(Self {
                data,
                version: 1,
                num_objects,
                fanout_offset,
                layout: Layout::V1,
                idx_path,
            })
        }
    }

    /// Look up an OID, returning the offset in the pack file.
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        self.find_offset(oid)
    }

    /// Look up an OID, returning the offset in the pack file.
    pub fn find_offset(&self, oid: &ObjectId) -> Option<u64> {
        let (lo, hi) = self.fanout_range(oid.first_byte());
        if lo >= hi {
            return None;
        }
        let target = oid.as_bytes().as_slice();

        let mut low = lo;
        let mut high = hi;
        while low < high {
            let mid = low + (high - low) / 2;
            let mid_oid = self.oid_bytes_at(mid);
            match mid_oid.cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(self.offset_at_index(mid as u32)),
            }
        }
        None
    }

    /// Whether this index contains `oid`.
    pub fn has_object(&self, oid: &ObjectId) -> bool {
        self.find_offset(oid).is_some()
    }

    /// Fill `out` with up to `limit` full ObjectIds whose prefix matches `abbrev`.
    ///
    /// Uses the fan-out to seek the bucket for the abbreviation's first byte,
    /// then bisects within it. Results are produced in sorted order.
    pub fn resolve(&self, abbrev: &AbbreviatedObjectId, limit: usize, out: &mut Vec<ObjectId>) {
        if abbrev.is_empty() || limit == 0 {
            return;
        }
        // The abbreviation's first hex digit pair selects the fan-out bucket;
        // with only one nibble we must scan the whole first-byte range it could fall in.
        let hex = abbrev.to_hex_string();
        let first_byte = u8::from_str_radix(&format!("{:0<2}", &hex[..hex.len().min(2)]), 16)
            .unwrap_or(0);

        let (mut lo, mut hi) = self.fanout_range(first_byte);
        if abbrev.len() < 2 {
            // Odd/short prefix: the matching range may span into neighboring buckets.
            lo = 0;
            hi = self.num_objects as usize;
        }

        for i in lo..hi {
            if out.len() >= limit {
                break;
            }
            let oid = self.oid_at_index(i as u32);
            if abbrev.matches(&oid) {
                out.push(oid);
            }
        }
    }

    /// Look up by raw OID-byte prefix, returning all matches as (OID, offset) pairs.
    pub fn lookup_prefix(&self, prefix: &[u8]) -> Vec<(ObjectId, u64)> {
        if prefix.is_empty() {
            return Vec::new();
        }

        let first_byte = prefix[0];
        let (lo, hi) = self.fanout_range(first_byte);

        let mut results = Vec::new();
        for i in lo..hi {
            let oid_bytes = self.oid_bytes_at(i);
            if oid_bytes.len() >= prefix.len() && oid_bytes[..prefix.len()] == *prefix {
                if let Ok(oid) = ObjectId::from_bytes(oid_bytes) {
                    results.push((oid, self.offset_at_index(i as u32)));
                }
            }
        }
        results
    }

    /// Get the OID at the given sorted index position.
    pub fn oid_at_index(&self, index: u32) -> ObjectId {
        ObjectId::from_bytes(self.oid_bytes_at(index as usize)).expect("valid OID in index")
    }

    /// Get the pack file offset at the given sorted index position.
    pub fn offset_at_index(&self, index: u32) -> u64 {
        match &self.layout {
            Layout::V1 => {
                let entry_start = 1024 + index as usize * (4 + HASH_LEN);
                let d = &self.data;
                u32::from_be_bytes([
                    d[entry_start],
                    d[entry_start + 1],
                    d[entry_start + 2],
                    d[entry_start + 3],
                ]) as u64
            }
            Layout::V2 {
                offset32_offset,
                offset64_offset,
                ..
            } => {
                let pos = offset32_offset + index as usize * 4;
                let d = &self.data;
                let val = u32::from_be_bytes([d[pos], d[pos + 1], d[pos + 2], d[pos + 3]]);
                if val & 0x8000_0000 != 0 {
                    let idx64 = (val & 0x7FFF_FFFF) as usize;
                    let pos64 = offset64_offset + idx64 * 8;
                    u64::from_be_bytes(d[pos64..pos64 + 8].try_into().unwrap())
                } else {
                    val as u64
                }
            }
        }
    }

    /// Get the CRC32 at the given sorted index position. v1 indexes don't
    /// store a CRC32 table and always return `0`.
    pub fn crc32_at_index(&self, index: u32) -> u32 {
        match &self.layout {
            Layout::V1 => 0,
            Layout::V2 { crc_offset, .. } => {
                let pos = crc_offset + index as usize * 4;
                let d = &self.data;
                u32::from_be_bytes([d[pos], d[pos + 1], d[pos + 2], d[pos + 3]])
            }
        }
    }

    /// Total number of objects in this index.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Index version (1 or 2).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Path to the .idx file.
    pub fn path(&self) -> &Path {
        &self.idx_path
    }

    /// Pack checksum stored in the index trailer.
    pub fn pack_checksum(&self) -> ObjectId {
        let start = self.data.len() - 2 * HASH_LEN;
        ObjectId::from_bytes(&self.data[start..start + HASH_LEN])
            .expect("valid checksum in index trailer")
    }

    /// Index checksum (the trailing hash of the index file itself).
    pub fn index_checksum(&self) -> ObjectId {
        let start = self.data.len() - HASH_LEN;
        ObjectId::from_bytes(&self.data[start..start + HASH_LEN])
            .expect("valid checksum in index trailer")
    }

    /// Recompute the SHA-1 over the index body and compare to the trailer.
    pub fn verify_checksum(&self) -> Result<(), PackError> {
        let body_end = self.data.len() - HASH_LEN;
        let computed = git_hash::hasher::Hasher::digest(&self.data[..body_end])
            .map_err(|e| PackError::InvalidIndex(e.to_string()))?;
        let stored = self.index_checksum();
        if computed != stored {
            return Err(PackError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        Ok(())
    }

    /// Iterate over all (OID, offset) pairs in sorted order.
    pub fn iter(&self) -> PackIndexIter<'_> {
        PackIndexIter { index: self, pos: 0 }
    }

    /// Get the fan-out range for a given first byte.
    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let end = self.fanout_entry(first_byte) as usize;
        let start = if first_byte == 0 {
            0
        } else {
            self.fanout_entry(first_byte - 1) as usize
        };
        (start, end)
    }

    fn fanout_entry(&self, index: u8) -> u32 {
        let pos = self.fanout_offset + index as usize * 4;
        let d = &self.data;
        u32::from_be_bytes([d[pos], d[pos + 1], d[pos + 2], d[pos + 3]])
    }

    /// Raw OID bytes at the given sorted index position.
    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        match &self.layout {
            Layout::V1 => {
                let start = 1024 + index * (4 + HASH_LEN) + 4;
                &self.data[start..start + HASH_LEN]
            }
            Layout::V2 { oid_offset, .. } => {
                let start = oid_offset + index * HASH_LEN;
                &self.data[start..start + HASH_LEN]
            }
        }
    }
}

/// Iterator over (OID, offset) pairs in a pack index.
pub struct PackIndexIter<'a> {
    index: &'a PackIndex,
    pos: u32,
}

impl<'a> Iterator for PackIndexIter<'a> {
    type Item = (ObjectId, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.index.num_objects {
            return None;
        }
        let oid = self.index.oid_at_index(self.pos);
        let offset = self.index.offset_at_index(self.pos);
        self.pos += 1;
        Some((oid, offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.index.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for PackIndexIter<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use git_hash::hasher::Hasher;
    use std::io::Write;

    /// Build a synthetic v2 pack index in memory for testing.
    fn build_test_index(oids_and_offsets: &[(ObjectId, u64, u32)]) -> Vec<u8> {
        let mut entries: Vec<_> = oids_and_offsets.to_vec();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buf = Vec::new();
        buf.extend_from_slice(&IDX_SIGNATURE);
        buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

        let mut fanout = [0u32; 256];
        for (oid, _, _) in &entries {
            let bucket = oid.first_byte() as usize;
            fanout[bucket] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        for count in fanout {
            buf.extend_from_slice(&count.to_be_bytes());
        }

        for (oid, _, _) in &entries {
            buf.extend_from_slice(oid.as_bytes());
        }
        for (_, _, crc) in &entries {
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        for (_, offset, _) in &entries {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
        }

        let fake_pack_checksum = [0u8; 20];
        buf.extend_from_slice(&fake_pack_checksum);

        let idx_checksum = Hasher::digest(&buf).unwrap();
        buf.extend_from_slice(idx_checksum.as_bytes());

        buf
    }

    /// Build a synthetic v1 pack index in memory for testing.
    fn build_test_index_v1(oids_and_offsets: &[(ObjectId, u64)]) -> Vec<u8> {
        let mut entries: Vec<_> = oids_and_offsets.to_vec();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buf = Vec::new();
        let mut fanout = [0u32; 256];
        for (oid, _) in &entries {
            fanout[oid.first_byte() as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        for count in fanout {
            buf.extend_from_slice(&count.to_be_bytes());
        }
        for (oid, offset) in &entries {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
            buf.extend_from_slice(oid.as_bytes());
        }
        let fake_pack_checksum = [0u8; 20];
        buf.extend_from_slice(&fake_pack_checksum);
        let idx_checksum = Hasher::digest(&buf).unwrap();
        buf.extend_from_slice(idx_checksum.as_bytes());
        buf
    }

    fn write_test_index(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("test.idx");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn make_oid(first_byte: u8, suffix: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        bytes[19] = suffix;
        ObjectId::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn open_and_lookup_single_object() {
        let dir = tempfile::tempdir().unwrap();
        let oid = make_oid(0xab, 0x01);
        let data = build_test_index(&[(oid, 12, 0xdeadbeef)]);
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.num_objects(), 1);
        assert_eq!(idx.version(), 2);

        assert_eq!(idx.lookup(&oid), Some(12));
        assert!(idx.has_object(&oid));

        let missing = make_oid(0xab, 0x02);
        assert_eq!(idx.lookup(&missing), None);
        assert!(!idx.has_object(&missing));
    }

    #[test]
    fn lookup_multiple_objects() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            (make_oid(0x00, 0x01), 100, 0x111),
            (make_oid(0x00, 0x02), 200, 0x222),
            (make_oid(0x0a, 0x01), 300, 0x333),
            (make_oid(0xff, 0x01), 400, 0x444),
        ];
        let data = build_test_index(&entries);
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.num_objects(), 4);

        for (oid, offset, _) in &entries {
            assert_eq!(idx.lookup(oid), Some(*offset));
        }
    }

    #[test]
    fn oid_at_index_returns_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            (make_oid(0xff, 0x01), 100, 0),
            (make_oid(0x00, 0x01), 200, 0),
            (make_oid(0x55, 0x01), 300, 0),
        ];
        let data = build_test_index(&entries);
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.oid_at_index(0), make_oid(0x00, 0x01));
        assert_eq!(idx.oid_at_index(1), make_oid(0x55, 0x01));
        assert_eq!(idx.oid_at_index(2), make_oid(0xff, 0x01));
    }

    #[test]
    fn crc32_at_index() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            (make_oid(0x10, 0x01), 100, 0xAAAA_BBBB),
            (make_oid(0x20, 0x01), 200, 0xCCCC_DDDD),
        ];
        let data = build_test_index(&entries);
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.crc32_at_index(0), 0xAAAA_BBBB);
        assert_eq!(idx.crc32_at_index(1), 0xCCCC_DDDD);
    }

    #[test]
    fn iterator_yields_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            (make_oid(0x01, 0x01), 100, 0),
            (make_oid(0x02, 0x01), 200, 0),
            (make_oid(0x03, 0x01), 300, 0),
        ];
        let data = build_test_index(&entries);
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        let items: Vec<_> = idx.iter().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].0, make_oid(0x01, 0x01));
        assert_eq!(items[0].1, 100);
    }

    #[test]
    fn lookup_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            (make_oid(0xab, 0x01), 100, 0),
            (make_oid(0xab, 0x02), 200, 0),
            (make_oid(0xac, 0x01), 300, 0),
        ];
        let data = build_test_index(&entries);
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        let results = idx.lookup_prefix(&[0xab]);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn resolve_abbreviation() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            (make_oid(0xab, 0x01), 100, 0),
            (make_oid(0xab, 0x02), 200, 0),
            (make_oid(0xac, 0x01), 300, 0),
        ];
        let data = build_test_index(&entries);
        let path = write_test_index(dir.path(), &data);
        let idx = PackIndex::open(&path).unwrap();

        let oid = entries[0].0;
        let abbrev = AbbreviatedObjectId::from_hex(&oid.to_hex()[..8]).unwrap();
        let mut out = Vec::new();
        idx.resolve(&abbrev, 10, &mut out);
        assert_eq!(out, vec![oid]);
    }

    #[test]
    fn empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_test_index(&[]);
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.num_objects(), 0);
        assert_eq!(idx.lookup(&make_oid(0x00, 0x00)), None);
        assert_eq!(idx.iter().count(), 0);
    }

    #[test]
    fn verify_checksum_passes_for_well_formed_index() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_test_index(&[(make_oid(0x01, 0x01), 42, 0)]);
        let path = write_test_index(dir.path(), &data);
        let idx = PackIndex::open(&path).unwrap();
        idx.verify_checksum().unwrap();
    }

    #[test]
    fn verify_checksum_fails_for_corrupt_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = build_test_index(&[(make_oid(0x01, 0x01), 42, 0)]);
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let path = write_test_index(dir.path(), &data);
        let idx = PackIndex::open(&path).unwrap();
        assert!(idx.verify_checksum().is_err());
    }

    #[test]
    fn build_test_index_with_64bit_offsets() {
        let oid = make_oid(0x42, 0x01);

        let mut buf = Vec::new();
        buf.extend_from_slice(&IDX_SIGNATURE);
        buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

        let mut fanout = [0u32; 256];
        for i in 0x42..256 {
            fanout[i] = 1;
        }
        for count in fanout {
            buf.extend_from_slice(&count.to_be_bytes());
        }

        buf.extend_from_slice(oid.as_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0x8000_0000u32.to_be_bytes());

        let large_offset: u64 = 5 * 1024 * 1024 * 1024;
        buf.extend_from_slice(&large_offset.to_be_bytes());

        let fake_pack_checksum = [0u8; 20];
        buf.extend_from_slice(&fake_pack_checksum);
        let idx_checksum = Hasher::digest(&buf).unwrap();
        buf.extend_from_slice(idx_checksum.as_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = write_test_index(dir.path(), &buf);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.num_objects(), 1);
        assert_eq!(idx.lookup(&oid), Some(large_offset));
    }

    #[test]
    fn v1_index_lookup() {
        let entries = vec![(make_oid(0x10, 0x01), 111u64), (make_oid(0x20, 0x01), 222u64)];
        let data = build_test_index_v1(&entries);
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.version(), 1);
        assert_eq!(idx.num_objects(), 2);
        for (oid, offset) in &entries {
            assert_eq!(idx.lookup(oid), Some(*offset));
        }
    }
}
