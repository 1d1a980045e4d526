//! Address-keyed write cache for one file's metadata.

use crate::wire::MemKind;
use std::collections::BTreeMap;

/// One cached metadata write. At most one exists per address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMod {
    pub mem_kind: MemKind,
    pub address: u64,
    pub payload: Vec<u8>,
}

impl MetadataMod {
    fn end(&self) -> u64 {
        self.address.saturating_add(self.payload.len() as u64)
    }
}

#[derive(Debug, Default)]
pub struct MetadataCache {
    mods: BTreeMap<u64, MetadataMod>,
    outstanding: usize,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the modification at `address`. Returns true when the address was not cached.
    pub fn write(&mut self, mem_kind: MemKind, address: u64, payload: Vec<u8>) -> bool {
        match self.mods.get_mut(&address) {
            Some(existing) => {
                existing.mem_kind = mem_kind;
                existing.payload = payload;
                false
            }
            None => {
                self.mods.insert(
                    address,
                    MetadataMod {
                        mem_kind,
                        address,
                        payload,
                    },
                );
                self.outstanding += 1;
                true
            }
        }
    }

    pub fn read(&self, address: u64) -> Option<&MetadataMod> {
        self.mods.get(&address)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    pub fn needs_dump(&self, high_water_mark: usize) -> bool {
        self.outstanding >= high_water_mark
    }

    /// Cached modifications in address order.
    pub fn entries(&self) -> impl Iterator<Item = &MetadataMod> {
        self.mods.values()
    }

    /// Forgets every modification after a successful dump. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.mods.len();
        self.mods.clear();
        self.outstanding = 0;
        dropped
    }

    /// Drops modifications overlapping `[address, address + size)`.
    pub fn remove_range(&mut self, address: u64, size: u64) -> usize {
        let end = address.saturating_add(size);
        let doomed: Vec<u64> = self
            .mods
            .range(..end)
            .filter(|(_, entry)| entry.end() > address || entry.address >= address)
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.mods.remove(key);
        }
        self.outstanding = self.outstanding.saturating_sub(doomed.len());
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_replaces_payload_without_counting_twice() {
        let mut cache = MetadataCache::new();
        assert!(cache.write(MemKind::Ohdr, 4096, b"first".to_vec()));
        assert!(!cache.write(MemKind::Ohdr, 4096, b"second".to_vec()));
        assert_eq!(cache.outstanding(), 1);
        assert_eq!(cache.read(4096).unwrap().payload, b"second");
        assert!(cache.read(4097).is_none());
    }

    #[test]
    fn entries_iterate_in_address_order() {
        let mut cache = MetadataCache::new();
        for address in [900u64, 12, 512, 64] {
            cache.write(MemKind::Btree, address, vec![address as u8]);
        }
        let order: Vec<u64> = cache.entries().map(|entry| entry.address).collect();
        assert_eq!(order, vec![12, 64, 512, 900]);
        assert!(cache.needs_dump(4));
        assert!(!cache.needs_dump(5));
        assert_eq!(cache.clear(), 4);
        assert_eq!(cache.outstanding(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_range_drops_overlapping_entries_only() {
        let mut cache = MetadataCache::new();
        cache.write(MemKind::Ohdr, 0, vec![0; 16]);
        cache.write(MemKind::Ohdr, 90, vec![0; 16]);
        cache.write(MemKind::Ohdr, 100, vec![0; 8]);
        cache.write(MemKind::Ohdr, 150, vec![0; 8]);
        cache.write(MemKind::Ohdr, 200, vec![0; 8]);

        assert_eq!(cache.remove_range(100, 100), 3);
        let left: Vec<u64> = cache.entries().map(|entry| entry.address).collect();
        assert_eq!(left, vec![0, 200]);
        assert_eq!(cache.outstanding(), 2);
    }
}
