use super::alloc::SpaceAllocator;
use super::cache::MetadataCache;
use super::locks::LockTable;
use crate::wire::{FileId, OpenParams};

/// Everything the set-aside process keeps for one open file.
#[derive(Debug)]
pub struct FileInfo {
    pub file_id: FileId,
    pub params: OpenParams,
    pub cache: MetadataCache,
    pub locks: LockTable,
    pub allocator: SpaceAllocator,
    closing: bool,
    close_votes: u32,
    poisoned: Option<String>,
}

impl FileInfo {
    pub fn new(file_id: FileId, params: OpenParams, eoa: u64, max_locks: usize) -> Self {
        Self {
            file_id,
            params,
            cache: MetadataCache::new(),
            locks: LockTable::new(max_locks),
            allocator: SpaceAllocator::new(&params, eoa),
            closing: false,
            close_votes: 0,
            poisoned: None,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn close_votes(&self) -> u32 {
        self.close_votes
    }

    /// Counts one CLOSE. Returns true once `participants` votes are in.
    pub fn record_close(&mut self, participants: u32) -> bool {
        self.closing = true;
        self.close_votes += 1;
        self.close_votes >= participants
    }

    /// Marks the file unusable until it is re-opened.
    pub fn poison(&mut self, reason: impl Into<String>) {
        if self.poisoned.is_none() {
            self.poisoned = Some(reason.into());
        }
    }

    pub fn poisoned(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }
}
