//! WindowCache: a byte-budget-bounded cache of pack windows.
//!
//! The pack bytes themselves are always reachable through the owning
//! `PackFile`'s `memmap2::Mmap` — this cache does not hold a second copy
//! of the bytes. What it bounds is the *logical view*: the set of
//! `(pack id, window-aligned offset)` keys considered resident, used to
//! decide when a new window should evict an old one. This generalizes
//! the `lru`-backed `ObjectCache` pattern (see `git-object::cache`) from
//! `ObjectId` keys to `(pack id, offset)` keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Default size of a single window, in bytes. Offsets are aligned down
/// to this boundary when computing a cache key.
pub const WINDOW_SIZE: u64 = 32 * 1024;

/// Default total byte budget for a `WindowCache`.
pub const DEFAULT_BYTE_BUDGET: u64 = 32 * 1024 * 1024;

/// Number of stripes in the per-key load lock table.
const LOCK_STRIPES: usize = 32;

/// A resident window: which pack and offset it covers, and its size.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    size: u64,
    last_access: u64,
}

/// Key identifying a window: the pack's id and its window-aligned offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub pack_id: u64,
    pub window_offset: u64,
}

impl WindowKey {
    fn new(pack_id: u64, offset: u64) -> Self {
        Self {
            pack_id,
            window_offset: (offset / WINDOW_SIZE) * WINDOW_SIZE,
        }
    }
}

fn stripe_for(key: &WindowKey) -> usize {
    let mut h = key.pack_id.wrapping_mul(0x9E3779B97F4A7C15);
    h ^= key.window_offset.wrapping_mul(0xC2B2AE3D27D4EB4F);
    (h as usize) % LOCK_STRIPES
}

/// Bounded accounting structure tracking which `(pack, offset)` windows
/// are considered "resident" for cache purposes.
///
/// Byte access always goes through the pack's own `Mmap`; this struct
/// answers "is this window hot" and evicts the coldest entries once the
/// budget is exceeded.
pub struct WindowCache {
    byte_budget: u64,
    resident_bytes: AtomicU64,
    clock: AtomicU64,
    table: RwLock<HashMap<WindowKey, WindowEntry>>,
    load_locks: Vec<Mutex<()>>,
}

impl WindowCache {
    pub fn new(byte_budget: u64) -> Self {
        Self {
            byte_budget,
            resident_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            table: RwLock::new(HashMap::new()),
            load_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Record a touch/load of `size` bytes at `(pack_id, offset)`, evicting
    /// older entries first if the budget would be exceeded.
    ///
    /// Callers should hold the stripe lock for `(pack_id, offset)` (via
    /// [`WindowCache::lock_for`]) around the `load` that produces `size`, so
    /// concurrent misses for the same key collapse into a single load.
    pub fn record(&self, pack_id: u64, offset: u64, size: u64) {
        let key = WindowKey::new(pack_id, offset);
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        {
            let table = self.table.read().unwrap();
            if let Some(_existing) = table.get(&key) {
                drop(table);
                let mut table = self.table.write().unwrap();
                if let Some(entry) = table.get_mut(&key) {
                    entry.last_access = tick;
                }
                return;
            }
        }

        self.evict_until_fits(size);

        let mut table = self.table.write().unwrap();
        table.insert(
            key,
            WindowEntry {
                size,
                last_access: tick,
            },
        );
        self.resident_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Whether the cache is at or over its byte budget.
    pub fn is_full(&self) -> bool {
        self.resident_bytes.load(Ordering::Relaxed) >= self.byte_budget
    }

    fn evict_until_fits(&self, incoming: u64) {
        while self.resident_bytes.load(Ordering::Relaxed) + incoming > self.byte_budget {
            let mut table = self.table.write().unwrap();
            if table.is_empty() {
                break;
            }
            let scan_len = (table.len() / 10).max(1);
            let victim = table
                .iter()
                .take(scan_len)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| *k);
            let Some(victim) = victim else { break };
            if let Some(entry) = table.remove(&victim) {
                self.resident_bytes.fetch_sub(entry.size, Ordering::Relaxed);
            }
        }
    }

    /// Evict every entry belonging to `pack_id`. Called when a `PackFile` is retired.
    pub fn remove_all(&self, pack_id: u64) {
        let mut table = self.table.write().unwrap();
        let mut freed = 0u64;
        table.retain(|k, v| {
            if k.pack_id == pack_id {
                freed += v.size;
                false
            } else {
                true
            }
        });
        self.resident_bytes.fetch_sub(freed, Ordering::Relaxed);
    }

    /// Lock the stripe guarding loads for `(pack_id, offset)` so that
    /// concurrent misses for the same window serialize on exactly one load.
    pub fn lock_for(&self, pack_id: u64, offset: u64) -> std::sync::MutexGuard<'_, ()> {
        let key = WindowKey::new(pack_id, offset);
        self.load_locks[stripe_for(&key)].lock().unwrap()
    }

    /// Number of resident bytes currently tracked.
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }
}

impl Default for WindowCache {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_BUDGET)
    }
}

/// A cursor over a pack's bytes, backed by its `Mmap` and reported to a
/// `WindowCache` so repeated reads at nearby offsets stay "hot".
pub struct WindowCursor<'a> {
    cache: &'a WindowCache,
    pack_id: u64,
    data: &'a [u8],
}

impl<'a> WindowCursor<'a> {
    pub fn new(cache: &'a WindowCache, pack_id: u64, data: &'a [u8]) -> Self {
        Self {
            cache,
            pack_id,
            data,
        }
    }

    /// Read `len` bytes starting at `offset`, recording the access with the cache.
    pub fn read_at(&self, offset: u64, len: usize) -> Option<&'a [u8]> {
        let start = offset as usize;
        let end = start.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let _guard = self.cache.lock_for(self.pack_id, offset);
        self.cache.record(self.pack_id, offset, len as u64);
        Some(&self.data[start..end])
    }

    /// Borrow the remaining bytes from `offset` to the end of the pack.
    /// Used when the exact length of a variable-width header isn't known yet.
    pub fn tail_from(&self, offset: u64) -> Option<&'a [u8]> {
        let start = offset as usize;
        if start > self.data.len() {
            return None;
        }
        let _guard = self.cache.lock_for(self.pack_id, offset);
        self.cache.record(self.pack_id, offset, WINDOW_SIZE);
        Some(&self.data[start..])
    }
}
