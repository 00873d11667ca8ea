//! PackFile: reading .pack files.
//!
//! A pack file contains a header, a sequence of compressed objects
//! (possibly deltified), and a trailing checksum.
//!
//! Each open pack moves through a small state machine: `Fresh` (not yet
//! opened) → `Open` (mmap'd and index-checked) → `Invalid` once a
//! mismatch between the on-disk file and what was opened is detected, or
//! `Closed` once explicitly retired. `Invalid` is terminal: every future
//! operation on the handle fails, and the owning `ObjectDirectory` treats
//! the pack as absent on its next scan.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use flate2::bufread::ZlibDecoder;
use git_hash::ObjectId;
use git_object::ObjectType;
use memmap2::Mmap;
use std::io::Read;

use crate::entry::{parse_entry_header, PackEntry};
use crate::index::PackIndex;
use crate::window::{WindowCache, WindowCursor};
use crate::{
    PackEntryType, PackError, PackedObject, MAX_DELTA_CHAIN_DEPTH, PACK_HEADER_SIZE,
    PACK_SIGNATURE, PACK_VERSION,
};

/// The lifecycle state of an open pack handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PackState {
    Fresh = 0,
    Open = 1,
    Invalid = 2,
    Closed = 3,
}

impl From<u8> for PackState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::Invalid,
            3 => Self::Closed,
            _ => Self::Fresh,
        }
    }
}

fn next_pack_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A memory-mapped packfile with its index.
pub struct PackFile {
    data: Mmap,
    index: PackIndex,
    pack_path: PathBuf,
    num_objects: u32,
    pack_id: u64,
    state: AtomicU8,
    mtime: std::time::SystemTime,
    len: u64,
    windows: Arc<WindowCache>,
}

impl PackFile {
    /// Open a pack file and its associated index, sharing the given window cache.
    pub fn open_with_cache(
        pack_path: impl AsRef<Path>,
        windows: Arc<WindowCache>,
    ) -> Result<Self, PackError> {
        let pack_path = pack_path.as_ref().to_path_buf();
        let idx_path = pack_path.with_extension("idx");

        let file = std::fs::File::open(&pack_path)?;
        let metadata = file.metadata()?;
        let mtime = metadata.modified()?;
        let len = metadata.len();

        let data = unsafe { Mmap::map(&file)? };

        if data.len() < PACK_HEADER_SIZE {
            return Err(PackError::InvalidHeader("file too small".into()));
        }
        if &data[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidHeader("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let num_objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let index = PackIndex::open(&idx_path)?;

        if index.num_objects() != num_objects {
            return Err(PackError::InvalidHeader(format!(
                "pack has {} objects but index has {}",
                num_objects,
                index.num_objects()
            )));
        }

        Ok(Self {
            data,
            index,
            pack_path,
            num_objects,
            pack_id: next_pack_id(),
            state: AtomicU8::new(PackState::Open as u8),
            mtime,
            len,
            windows,
        })
    }

    /// Open a pack file and its associated index with a private, default-sized window cache.
    pub fn open(pack_path: impl AsRef<Path>) -> Result<Self, PackError> {
        Self::open_with_cache(pack_path, Arc::new(WindowCache::default()))
    }

    /// Current lifecycle state of this handle.
    pub fn state(&self) -> PackState {
        PackState::from(self.state.load(Ordering::Acquire))
    }

    /// Mark this handle invalid. Irreversible.
    fn invalidate(&self) {
        self.state.store(PackState::Invalid as u8, Ordering::Release);
    }

    /// Retire this handle explicitly, releasing its windows.
    pub fn close(&self) {
        self.state.store(PackState::Closed as u8, Ordering::Release);
        self.windows.remove_all(self.pack_id);
    }

    /// Check whether the file on disk still matches what we opened.
    /// If it doesn't, invalidates the handle and returns `PackMismatch`.
    fn check_fresh(&self) -> Result<(), PackError> {
        match self.state() {
            PackState::Invalid => return Err(PackError::Invalid),
            PackState::Closed => return Err(PackError::Invalid),
            _ => {}
        }
        let metadata = std::fs::metadata(&self.pack_path)?;
        let mtime_changed = metadata
            .modified()
            .map(|m| m != self.mtime)
            .unwrap_or(true);
        if mtime_changed || metadata.len() != self.len {
            self.invalidate();
            return Err(PackError::PackMismatch {
                path: self.pack_path.clone(),
            });
        }
        Ok(())
    }

    /// Check if this pack contains the given OID — consults the index only.
    pub fn has_object(&self, oid: &ObjectId) -> bool {
        self.index.has_object(oid)
    }

    /// Read an object by OID.
    ///
    /// Returns `None` if the OID is not in this pack.
    pub fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>, PackError> {
        self.check_fresh()?;
        match self.index.find_offset(oid) {
            Some(offset) => self.read_at_offset(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Read an object at a known offset in the pack.
    ///
    /// Resolves delta chains iteratively (not recursively) to handle
    /// arbitrary chain depths safely.
    pub fn read_at_offset(&self, offset: u64) -> Result<PackedObject, PackError> {
        self.check_fresh()?;
        self.read_at_offset_with_resolver(offset, |_| None)
    }

    /// Read the object's total size without fully inflating it, where possible.
    pub fn get_object_size(&self, oid: &ObjectId) -> Result<Option<usize>, PackError> {
        self.check_fresh()?;
        let Some(offset) = self.index.find_offset(oid) else {
            return Ok(None);
        };
        let cursor = WindowCursor::new(&self.windows, self.pack_id, &self.data);
        let header_bytes = cursor
            .tail_from(offset)
            .ok_or(PackError::CorruptEntry(offset))?;
        let entry = parse_entry_header(header_bytes, offset)?;
        Ok(Some(entry.uncompressed_size))
    }

    /// Read an object by OID, with an external resolver for cross-pack REF_DELTA bases.
    ///
    /// The resolver is called when a REF_DELTA references a base OID not found in this pack.
    /// It should return the resolved base object's type and data if found externally.
    pub fn read_object_with_resolver(
        &self,
        oid: &ObjectId,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<Option<PackedObject>, PackError> {
        self.check_fresh()?;
        match self.index.find_offset(oid) {
            Some(offset) => self.read_at_offset_with_resolver(offset, resolver).map(Some),
            None => Ok(None),
        }
    }

    /// Read an object at a known offset, with an external resolver for cross-pack REF_DELTA bases.
    fn read_at_offset_with_resolver(
        &self,
        offset: u64,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<PackedObject, PackError> {
        let cursor = WindowCursor::new(&self.windows, self.pack_id, &self.data);

        // Build the delta chain (innermost delta first, base last)
        let mut chain: Vec<(PackEntry, Vec<u8>)> = Vec::new();
        let mut current_offset = offset;

        for depth in 0..MAX_DELTA_CHAIN_DEPTH {
            let header_bytes = cursor
                .tail_from(current_offset)
                .ok_or(PackError::CorruptEntry(current_offset))?;
            let entry = parse_entry_header(header_bytes, current_offset)?;

            let compressed = cursor
                .tail_from(entry.data_offset)
                .ok_or(PackError::CorruptEntry(current_offset))?;
            let decompressed = decompress(compressed, entry.uncompressed_size, current_offset)?;

            match entry.entry_type {
                PackEntryType::Commit
                | PackEntryType::Tree
                | PackEntryType::Blob
                | PackEntryType::Tag => {
                    let obj_type = entry
                        .entry_type
                        .to_object_type()
                        .expect("non-delta type");

                    let mut data = decompressed;
                    for (_, delta_data) in chain.iter().rev() {
                        data = crate::delta::apply::apply_delta(&data, delta_data)?;
                    }

                    return Ok(PackedObject { obj_type, data });
                }
                PackEntryType::OfsDelta { base_offset } => {
                    chain.push((entry, decompressed));
                    current_offset = base_offset;
                }
                PackEntryType::RefDelta { base_oid } => {
                    chain.push((entry, decompressed));
                    if let Some(base_offset) = self.index.find_offset(&base_oid) {
                        current_offset = base_offset;
                    } else if let Some((obj_type, base_data)) = resolver(&base_oid) {
                        let mut data = base_data;
                        for (_, delta_data) in chain.iter().rev() {
                            data = crate::delta::apply::apply_delta(&data, delta_data)?;
                        }
                        return Ok(PackedObject { obj_type, data });
                    } else {
                        return Err(PackError::MissingBase(base_oid));
                    }
                }
            }

            if depth + 1 >= MAX_DELTA_CHAIN_DEPTH {
                return Err(PackError::DeltaChainTooDeep {
                    offset,
                    max_depth: MAX_DELTA_CHAIN_DEPTH,
                });
            }
        }

        Err(PackError::DeltaChainTooDeep {
            offset,
            max_depth: MAX_DELTA_CHAIN_DEPTH,
        })
    }

    /// Check if this pack contains the given OID.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.has_object(oid)
    }

    /// Get the number of objects in this pack.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Get the pack index.
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Get the path to the .pack file.
    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    /// Get the raw memory-mapped pack data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Opaque identity used as the window cache key prefix for this pack.
    pub fn pack_id(&self) -> u64 {
        self.pack_id
    }

    /// Modification time observed when this handle was opened.
    pub fn mtime(&self) -> std::time::SystemTime {
        self.mtime
    }

    /// File stem of the `.pack` path (e.g. `pack-<40-hex>`), used to match
    /// handles across rescans so an unchanged pack can be reused.
    pub fn basename(&self) -> std::borrow::Cow<'_, str> {
        self.pack_path
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    }
}

/// Decompress zlib data with an expected uncompressed size.
fn decompress(compressed: &[u8], expected_size: usize, offset: u64) -> Result<Vec<u8>, PackError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut buf = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut buf)
        .map_err(|_| PackError::CorruptEntry(offset))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::compute::compute_delta;
    use crate::entry::encode_entry_header;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use git_hash::hasher::Hasher;
    use git_object::ObjectType;
    use std::io::Write;

    /// Build a minimal valid .pack + .idx pair in a temp directory.
    /// Returns the path to the .pack file.
    fn build_test_pack(dir: &Path, objects: &[(ObjectType, &[u8])]) -> (PathBuf, Vec<ObjectId>) {
        let pack_path = dir.join("test.pack");
        let idx_path = dir.join("test.idx");

        let mut pack_data = Vec::new();

        pack_data.extend_from_slice(PACK_SIGNATURE);
        pack_data.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack_data.extend_from_slice(&(objects.len() as u32).to_be_bytes());

        let mut entries: Vec<(ObjectId, u64, u32)> = Vec::new();

        for (obj_type, content) in objects {
            let offset = pack_data.len() as u64;

            let type_num = match obj_type {
                ObjectType::Commit => 1,
                ObjectType::Tree => 2,
                ObjectType::Blob => 3,
                ObjectType::Tag => 4,
            };

            let header = encode_entry_header(type_num, content.len() as u64);
            let mut compressed = Vec::new();
            {
                let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
                encoder.write_all(content).unwrap();
                encoder.finish().unwrap();
            }

            let mut crc_hasher = crc32fast::Hasher::new();
            crc_hasher.update(&header);
            crc_hasher.update(&compressed);
            let crc = crc_hasher.finalize();

            let oid = Hasher::hash_object(
                obj_type.as_bytes().iter().map(|&b| b as char).collect::<String>().as_str(),
                content,
            )
            .unwrap();

            pack_data.extend_from_slice(&header);
            pack_data.extend_from_slice(&compressed);

            entries.push((oid, offset, crc));
        }

        let pack_checksum = Hasher::digest(&pack_data).unwrap();
        pack_data.extend_from_slice(pack_checksum.as_bytes());

        std::fs::write(&pack_path, &pack_data).unwrap();

        let oids: Vec<ObjectId> = entries.iter().map(|(oid, _, _)| *oid).collect();
        let idx_data = build_test_idx(&entries, pack_checksum.as_bytes());
        std::fs::write(&idx_path, &idx_data).unwrap();

        (pack_path, oids)
    }

    /// Build a v2 .idx file from sorted entries.
    fn build_test_idx(entries: &[(ObjectId, u64, u32)], pack_checksum: &[u8]) -> Vec<u8> {
        use crate::{IDX_SIGNATURE, IDX_VERSION};

        let mut sorted: Vec<_> = entries.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buf = Vec::new();
        buf.extend_from_slice(&IDX_SIGNATURE);
        buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

        let mut fanout = [0u32; 256];
        for (oid, _, _) in &sorted {
            fanout[oid.first_byte() as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        for count in fanout {
            buf.extend_from_slice(&count.to_be_bytes());
        }

        for (oid, _, _) in &sorted {
            buf.extend_from_slice(oid.as_bytes());
        }
        for (_, _, crc) in &sorted {
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        for (_, offset, _) in &sorted {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
        }

        buf.extend_from_slice(pack_checksum);

        let idx_checksum = Hasher::digest(&buf).unwrap();
        buf.extend_from_slice(idx_checksum.as_bytes());

        buf
    }

    #[test]
    fn read_single_blob() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"Hello, packfile world!";
        let (pack_path, oids) = build_test_pack(dir.path(), &[(ObjectType::Blob, content)]);

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 1);
        assert_eq!(pack.state(), PackState::Open);

        let obj = pack.read_object(&oids[0]).unwrap().unwrap();
        assert_eq!(obj.obj_type, ObjectType::Blob);
        assert_eq!(obj.data, content);
    }

    #[test]
    fn read_multiple_objects() {
        let dir = tempfile::tempdir().unwrap();
        let objects = vec![
            (ObjectType::Blob, b"blob content".as_slice()),
            (ObjectType::Blob, b"another blob".as_slice()),
            (ObjectType::Commit, b"tree 0000000000000000000000000000000000000000\nauthor Test <test@test.com> 0 +0000\ncommitter Test <test@test.com> 0 +0000\n\ntest commit\n".as_slice()),
        ];
        let (pack_path, oids) = build_test_pack(dir.path(), &objects);

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 3);

        for (i, (obj_type, content)) in objects.iter().enumerate() {
            let obj = pack.read_object(&oids[i]).unwrap().unwrap();
            assert_eq!(obj.obj_type, *obj_type);
            assert_eq!(obj.data, *content);
        }
    }

    #[test]
    fn contains_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (pack_path, oids) = build_test_pack(dir.path(), &[(ObjectType::Blob, b"test")]);

        let pack = PackFile::open(&pack_path).unwrap();
        assert!(pack.contains(&oids[0]));

        let missing = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        assert!(!pack.contains(&missing));
        assert_eq!(pack.read_object(&missing).unwrap(), None);
    }

    #[test]
    fn mismatch_after_truncation_invalidates_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (pack_path, oids) = build_test_pack(dir.path(), &[(ObjectType::Blob, b"test")]);

        let pack = PackFile::open(&pack_path).unwrap();
        // Touch the pack file so its mtime/size visibly changes.
        let mut extra = std::fs::read(&pack_path).unwrap();
        extra.push(0);
        std::fs::write(&pack_path, &extra).unwrap();

        let result = pack.read_object(&oids[0]);
        assert!(matches!(result, Err(PackError::PackMismatch { .. })));
        assert_eq!(pack.state(), PackState::Invalid);

        // Once invalid, every further operation fails without re-checking disk.
        assert!(matches!(pack.read_object(&oids[0]), Err(PackError::Invalid)));
    }

    #[test]
    fn close_releases_window_cache_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (pack_path, oids) = build_test_pack(dir.path(), &[(ObjectType::Blob, b"test")]);
        let pack = PackFile::open(&pack_path).unwrap();
        pack.read_object(&oids[0]).unwrap();
        pack.close();
        assert_eq!(pack.state(), PackState::Closed);
        assert!(matches!(pack.read_object(&oids[0]), Err(PackError::Invalid)));
    }

    #[test]
    fn read_ofs_delta_object() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("test.pack");
        let idx_path = dir.path().join("test.idx");

        let base_content = b"Hello, this is the base object content for delta testing!";

        let base_header = encode_entry_header(3, base_content.len() as u64);
        let mut base_compressed = Vec::new();
        {
            let mut enc = ZlibEncoder::new(&mut base_compressed, Compression::default());
            enc.write_all(base_content).unwrap();
            enc.finish().unwrap();
        }

        let target_content = b"Hello, this is the modified object content for delta testing!";
        let delta_bytes = compute_delta(base_content, target_content);

        let base_offset_in_pack = PACK_HEADER_SIZE;
        let delta_offset_in_pack = PACK_HEADER_SIZE + base_header.len() + base_compressed.len();
        let negative_offset = delta_offset_in_pack - base_offset_in_pack;

        let delta_header = encode_entry_header(6, delta_bytes.len() as u64);
        let ofs_encoded = crate::entry::encode_ofs_delta_offset(negative_offset as u64);

        let mut delta_compressed = Vec::new();
        {
            let mut enc = ZlibEncoder::new(&mut delta_compressed, Compression::default());
            enc.write_all(&delta_bytes).unwrap();
            enc.finish().unwrap();
        }

        let mut pack_data = Vec::new();
        pack_data.extend_from_slice(PACK_SIGNATURE);
        pack_data.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack_data.extend_from_slice(&2u32.to_be_bytes());

        let base_entry_offset = pack_data.len() as u64;
        pack_data.extend_from_slice(&base_header);
        pack_data.extend_from_slice(&base_compressed);

        let delta_entry_offset = pack_data.len() as u64;
        pack_data.extend_from_slice(&delta_header);
        pack_data.extend_from_slice(&ofs_encoded);
        pack_data.extend_from_slice(&delta_compressed);

        let pack_checksum = Hasher::digest(&pack_data).unwrap();
        pack_data.extend_from_slice(pack_checksum.as_bytes());

        std::fs::write(&pack_path, &pack_data).unwrap();

        let base_oid = Hasher::hash_object("blob", base_content).unwrap();
        let target_oid = Hasher::hash_object("blob", target_content).unwrap();

        let base_crc = {
            let mut h = crc32fast::Hasher::new();
            h.update(&base_header);
            h.update(&base_compressed);
            h.finalize()
        };
        let delta_crc = {
            let mut h = crc32fast::Hasher::new();
            h.update(&delta_header);
            h.update(&ofs_encoded);
            h.update(&delta_compressed);
            h.finalize()
        };

        let idx_data = build_test_idx(
            &[
                (base_oid, base_entry_offset, base_crc),
                (target_oid, delta_entry_offset, delta_crc),
            ],
            pack_checksum.as_bytes(),
        );
        std::fs::write(&idx_path, &idx_data).unwrap();

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 2);

        let base_obj = pack.read_object(&base_oid).unwrap().unwrap();
        assert_eq!(base_obj.data, base_content.as_slice());

        let delta_obj = pack.read_object(&target_oid).unwrap().unwrap();
        assert_eq!(delta_obj.obj_type, ObjectType::Blob);
        assert_eq!(delta_obj.data, target_content.as_slice());
    }
}
