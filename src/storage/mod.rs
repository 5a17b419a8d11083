//! Storage Module
//!
//! Thin adapter over the embedded ordered store (RocksDB). The rest of the
//! crate sees exactly the contract the engines need: point gets in two read
//! profiles, atomic write batches, consistent snapshots, and prefix scans
//! in either direction.
//!
//! ## Read profiles
//! - default: cache-filling, for point lookups on hot paths
//! - no-cache-fill: for bulk deletes and one-shot walks that would
//!   otherwise evict the working set

use std::path::Path;
use std::rc::Rc;

use rocksdb::{
    BlockBasedOptions, Cache, DBRawIterator, Options, ReadOptions, Snapshot, WriteBatch, DB,
};

use crate::config::Config;
use crate::error::Result;
use crate::keys::{KeyBuffer, KeyTag};

/// Handle to the ordered store. Safe to share across worker threads.
pub struct Store {
    db: DB,
}

impl Store {
    /// Open (or create) the store with the configured block cache and
    /// Bloom filter policy.
    pub fn open(config: &Config) -> Result<Store> {
        Self::open_path(config, &config.data_dir)
    }

    pub fn open_path(config: &Config, path: &Path) -> Result<Store> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&Cache::new_lru_cache(config.block_cache_bytes));
        block_opts.set_bloom_filter(config.bloom_bits_per_key as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path)?;
        Ok(Store { db })
    }

    // -------------------------------------------------------------------------
    // Point reads
    // -------------------------------------------------------------------------

    /// Cache-filling point get.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// Point get that does not populate the block cache.
    pub fn get_nofill(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut opts = ReadOptions::default();
        opts.fill_cache(false);
        Ok(self.db.get_opt(key, &opts)?)
    }

    /// Point get pinned to a snapshot.
    pub fn get_at(&self, snapshot: &Snapshot<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(snapshot.get(key)?)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Commit a batch atomically. Either every staged Put/Delete becomes
    /// visible or none does.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        Ok(self.db.write(batch)?)
    }

    // -------------------------------------------------------------------------
    // Snapshots & scans
    // -------------------------------------------------------------------------

    /// A read-consistent view. Released when dropped. Wrapped in `Rc` so
    /// one snapshot can back several concurrent scans (the multi-key
    /// merge iterator opens one scan per input under a single view).
    pub fn snapshot(&self) -> Rc<Snapshot<'_>> {
        Rc::new(self.db.snapshot())
    }

    /// Forward scan over one key-space prefix, from its first record.
    pub fn scan<'a>(
        &'a self,
        snapshot: Option<Rc<Snapshot<'a>>>,
        prefix: KeyBuffer,
        fill_cache: bool,
    ) -> PrefixScan<'a> {
        self.scan_from(snapshot, prefix, None, false, fill_cache)
    }

    /// Backward scan over one key-space prefix, from its last record.
    pub fn scan_rev<'a>(
        &'a self,
        snapshot: Option<Rc<Snapshot<'a>>>,
        prefix: KeyBuffer,
        fill_cache: bool,
    ) -> PrefixScan<'a> {
        self.scan_from(snapshot, prefix, None, true, fill_cache)
    }

    /// Scan over one key-space prefix starting at an explicit position.
    ///
    /// Forward: begins at the first record >= `start`. Backward: begins at
    /// the last record < `start` (so `start` is an exclusive upper bound;
    /// `None` uses the prefix upper bound, i.e. the whole key-space).
    /// Records outside the prefix end the scan.
    pub fn scan_from<'a>(
        &'a self,
        snapshot: Option<Rc<Snapshot<'a>>>,
        prefix: KeyBuffer,
        start: Option<&[u8]>,
        reverse: bool,
        fill_cache: bool,
    ) -> PrefixScan<'a> {
        let mut opts = ReadOptions::default();
        opts.fill_cache(fill_cache);
        if let Some(snap) = &snapshot {
            opts.set_snapshot(snap.as_ref());
        }
        let mut it = self.db.raw_iterator_opt(opts);

        if reverse {
            let bound = match start {
                Some(b) => b.to_vec(),
                None => prefix.upper_bound(),
            };
            if bound.is_empty() {
                // all-0xFF prefix: no finite bound, start at the very end
                it.seek_to_last();
            } else {
                it.seek(&bound);
                if it.valid() {
                    it.prev();
                } else {
                    it.seek_to_last();
                }
            }
        } else {
            match start {
                Some(b) => it.seek(b),
                None => it.seek(&prefix.as_bytes()[..prefix.prefix_len()]),
            }
        }

        PrefixScan {
            it,
            _snapshot: snapshot,
            prefix,
            reverse,
        }
    }

    /// Scan the metadata key-space (`Meta | K` records), yielding
    /// `(user key, metadata value)`. Used by KEYS.
    pub fn scan_meta<'a>(&'a self, snapshot: Option<Rc<Snapshot<'a>>>) -> MetaScan<'a> {
        let mut opts = ReadOptions::default();
        if let Some(snap) = &snapshot {
            opts.set_snapshot(snap.as_ref());
        }
        let mut it = self.db.raw_iterator_opt(opts);
        it.seek([KeyTag::Meta as u8]);
        MetaScan {
            it,
            _snapshot: snapshot,
        }
    }
}

/// Pull iterator over every metadata record.
pub struct MetaScan<'a> {
    it: DBRawIterator<'a>,
    _snapshot: Option<Rc<Snapshot<'a>>>,
}

impl Iterator for MetaScan<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.it.valid() {
            return None;
        }
        let key = self.it.key()?;
        if key.first() != Some(&(KeyTag::Meta as u8)) {
            return None;
        }
        let user_key = key[1..].to_vec();
        let value = self.it.value().map(|v| v.to_vec()).unwrap_or_default();
        self.it.next();
        Some((user_key, value))
    }
}

/// Pull iterator over the records of one key-space prefix.
///
/// Yields `(record key, value)` pairs and stops at the first key outside
/// the prefix. Owns its snapshot (if any), so dropping the scan releases
/// the snapshot on every exit path.
pub struct PrefixScan<'a> {
    // field order matters: the iterator must drop before the snapshot
    it: DBRawIterator<'a>,
    _snapshot: Option<Rc<Snapshot<'a>>>,
    prefix: KeyBuffer,
    reverse: bool,
}

impl PrefixScan<'_> {
    /// Length of the `tag | len32 | key` prefix shared by every yielded key.
    pub fn prefix_len(&self) -> usize {
        self.prefix.prefix_len()
    }
}

impl Iterator for PrefixScan<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.it.valid() {
            return None;
        }
        let key = self.it.key()?.to_vec();
        if !self.prefix.is_prefix_of(&key) {
            return None;
        }
        let value = self.it.value().map(|v| v.to_vec()).unwrap_or_default();
        if self.reverse {
            self.it.prev();
        } else {
            self.it.next();
        }
        Some((key, value))
    }
}
