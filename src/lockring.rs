//! Per-Key Lock Ring
//!
//! A fixed array of read/write locks indexed by a stable hash of the user
//! key. Mutations on the same logical key serialize on the same slot;
//! distinct keys may share a slot (false contention is the price of the
//! bounded memory footprint). Read-only commands never touch the ring;
//! they read through snapshots instead.

use crc::{Crc, CRC_32_ISO_HDLC};
use parking_lot::{RwLock, RwLockWriteGuard};

/// CRC32-IEEE, the stable hash mapping keys onto slots.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Fixed ring of per-key write locks.
pub struct LockRing {
    locks: Vec<RwLock<()>>,
}

impl LockRing {
    pub fn new(size: u32) -> Self {
        let size = size.max(1) as usize;
        let mut locks = Vec::with_capacity(size);
        for _ in 0..size {
            locks.push(RwLock::new(()));
        }
        LockRing { locks }
    }

    /// Slot index for a user key. The same key always maps to the same slot.
    pub fn slot(&self, key: &[u8]) -> usize {
        (CRC32.checksum(key) as usize) % self.locks.len()
    }

    /// Acquire the write lock for a single key.
    pub fn lock(&self, key: &[u8]) -> RwLockWriteGuard<'_, ()> {
        self.locks[self.slot(key)].write()
    }

    /// Acquire write locks for every key a command will mutate.
    ///
    /// Slots are sorted and deduplicated before locking, which gives all
    /// commands one global acquisition order (no AB/BA deadlock) and
    /// handles two distinct keys hashing to the same slot. Guards unlock
    /// in reverse acquisition order when the returned Vec drops.
    pub fn lock_many(&self, keys: &[&[u8]]) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut slots: Vec<usize> = keys.iter().map(|k| self.slot(k)).collect();
        slots.sort_unstable();
        slots.dedup();
        slots.into_iter().map(|s| self.locks[s].write()).collect()
    }
}
