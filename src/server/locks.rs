//! Per-file object lock table with group-atomic acquire and release.

use crate::wire::{LockKind, ObjectId, ObjectKind, Rank, Status};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use thiserror::Error;

/// One member of a lock group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub object_id: ObjectId,
    pub object_kind: ObjectKind,
    pub lock_kind: LockKind,
}

/// A held lock. Readers from several ranks share one entry; a WRITE entry has one holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLock {
    pub object_id: ObjectId,
    pub object_kind: ObjectKind,
    /// Rank of the earliest holder still present.
    pub owner_rank: Rank,
    pub lock_kind: LockKind,
    holders: BTreeMap<Rank, u32>,
    /// References the sole reader held before upgrading to WRITE. Dropping back to this
    /// count restores READ.
    upgraded_from: Option<u32>,
}

impl ObjectLock {
    fn granted(rank: Rank, request: &LockRequest) -> Self {
        let mut holders = BTreeMap::new();
        holders.insert(rank, 1);
        Self {
            object_id: request.object_id,
            object_kind: request.object_kind,
            owner_rank: rank,
            lock_kind: request.lock_kind,
            holders,
            upgraded_from: None,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.holders.values().sum()
    }

    pub fn holders(&self) -> impl Iterator<Item = (Rank, u32)> + '_ {
        self.holders.iter().map(|(rank, count)| (*rank, *count))
    }

    pub fn is_held_by(&self, rank: Rank) -> bool {
        self.holders.contains_key(&rank)
    }

    fn sole_holder(&self) -> Option<Rank> {
        if self.holders.len() == 1 {
            self.holders.keys().next().copied()
        } else {
            None
        }
    }

    fn try_grant(&mut self, rank: Rank, wanted: LockKind) -> Result<(), LockError> {
        let shared = self.lock_kind == LockKind::Read && wanted == LockKind::Read;
        let reentrant = self.sole_holder() == Some(rank);
        if !shared && !reentrant {
            return Err(LockError::Conflict {
                object_id: self.object_id,
                held: self.lock_kind,
                owner: self.owner_rank,
            });
        }
        let held = self.holders.entry(rank).or_insert(0);
        if wanted == LockKind::Write && self.lock_kind == LockKind::Read {
            self.upgraded_from = Some(*held);
            self.lock_kind = LockKind::Write;
        }
        *held += 1;
        Ok(())
    }

    fn drop_one(&mut self, rank: Rank) -> Result<(), LockError> {
        if self.holders.is_empty() {
            return Err(LockError::NotHeld {
                object_id: self.object_id,
            });
        }
        let Entry::Occupied(mut held) = self.holders.entry(rank) else {
            return Err(LockError::NotOwner {
                object_id: self.object_id,
                rank,
            });
        };
        *held.get_mut() -= 1;
        let remaining = *held.get();
        if remaining == 0 {
            held.remove();
        }
        if self.upgraded_from.is_some_and(|floor| remaining <= floor) {
            self.lock_kind = LockKind::Read;
            self.upgraded_from = None;
        }
        if let Some(first) = self.holders.keys().next() {
            if !self.holders.contains_key(&self.owner_rank) {
                self.owner_rank = *first;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("object {object_id} already {held}-locked by rank {owner}")]
    Conflict {
        object_id: ObjectId,
        held: LockKind,
        owner: Rank,
    },
    #[error("lock table full ({limit} locks)")]
    Capacity { limit: usize },
    #[error("object {object_id} is not locked")]
    NotHeld { object_id: ObjectId },
    #[error("rank {rank} does not hold the lock on {object_id}")]
    NotOwner { object_id: ObjectId, rank: Rank },
    #[error("lock table invariant violated on {object_id}: {detail}")]
    Invariant { object_id: ObjectId, detail: String },
}

impl LockError {
    pub fn status(&self) -> Status {
        match self {
            LockError::Conflict { .. } => Status::LockFailed,
            LockError::Capacity { .. } => Status::Oom,
            LockError::NotHeld { .. } => Status::NoLock,
            LockError::NotOwner { .. } => Status::BadLock,
            LockError::Invariant { .. } => Status::Catastrophic,
        }
    }
}

#[derive(Debug)]
pub struct LockTable {
    locks: BTreeMap<ObjectId, ObjectLock>,
    max_locks: usize,
}

impl LockTable {
    pub fn new(max_locks: usize) -> Self {
        Self {
            locks: BTreeMap::new(),
            max_locks,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<&ObjectLock> {
        self.locks.get(object_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectLock> {
        self.locks.values()
    }

    /// Grants every member of `group` to `rank`, or none of them.
    ///
    /// Members are applied in order to staged copies of the affected entries, so a group
    /// may lock the same object twice (re-entrancy) or upgrade its own READ lock.
    pub fn acquire_group(&mut self, rank: Rank, group: &[LockRequest]) -> Result<(), LockError> {
        let mut staged: BTreeMap<ObjectId, ObjectLock> = BTreeMap::new();
        for request in group {
            match staged.entry(request.object_id) {
                Entry::Occupied(mut entry) => entry.get_mut().try_grant(rank, request.lock_kind)?,
                Entry::Vacant(entry) => match self.locks.get(&request.object_id) {
                    Some(existing) => {
                        let mut lock = existing.clone();
                        lock.try_grant(rank, request.lock_kind)?;
                        entry.insert(lock);
                    }
                    None => {
                        entry.insert(ObjectLock::granted(rank, request));
                    }
                },
            }
        }
        let fresh = staged
            .keys()
            .filter(|object_id| !self.locks.contains_key(object_id))
            .count();
        if self.locks.len() + fresh > self.max_locks {
            return Err(LockError::Capacity {
                limit: self.max_locks,
            });
        }
        self.locks.extend(staged);
        Ok(())
    }

    /// Drops one reference per member for `rank`, or none if any member is invalid.
    pub fn release_group(&mut self, rank: Rank, group: &[ObjectId]) -> Result<(), LockError> {
        let mut staged: BTreeMap<ObjectId, ObjectLock> = BTreeMap::new();
        for object_id in group {
            let lock = match staged.entry(*object_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let existing = self
                        .locks
                        .get(object_id)
                        .ok_or(LockError::NotHeld {
                            object_id: *object_id,
                        })?;
                    entry.insert(existing.clone())
                }
            };
            lock.drop_one(rank)?;
        }
        for (object_id, lock) in staged {
            if lock.ref_count() == 0 {
                self.locks.remove(&object_id);
            } else {
                self.locks.insert(object_id, lock);
            }
        }
        Ok(())
    }

    /// Forgets every reference `rank` still holds. Returns how many locks were touched.
    pub fn release_rank(&mut self, rank: Rank) -> usize {
        let mut touched = 0;
        self.locks.retain(|_, lock| {
            if lock.holders.remove(&rank).is_some() {
                touched += 1;
                if let Some(first) = lock.holders.keys().next() {
                    lock.owner_rank = *first;
                }
            }
            !lock.holders.is_empty()
        });
        touched
    }

    /// Checks the exclusivity invariant over the whole table.
    pub fn verify(&self) -> Result<(), LockError> {
        for lock in self.locks.values() {
            let detail = if lock.ref_count() == 0 {
                Some("entry with zero references".to_string())
            } else if lock.lock_kind == LockKind::Write && lock.holders.len() != 1 {
                Some(format!("WRITE lock with {} holders", lock.holders.len()))
            } else if !lock.holders.contains_key(&lock.owner_rank) {
                Some(format!("owner {} holds no reference", lock.owner_rank))
            } else {
                None
            };
            if let Some(detail) = detail {
                return Err(LockError::Invariant {
                    object_id: lock.object_id,
                    detail,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u64) -> ObjectId {
        ObjectId::from_address(n)
    }

    fn req(n: u64, lock_kind: LockKind) -> LockRequest {
        LockRequest {
            object_id: oid(n),
            object_kind: ObjectKind::Dataset,
            lock_kind,
        }
    }

    #[test]
    fn readers_share_and_writers_exclude() {
        let mut table = LockTable::new(16);
        table.acquire_group(1, &[req(1, LockKind::Read)]).unwrap();
        table.acquire_group(2, &[req(1, LockKind::Read)]).unwrap();
        assert_eq!(table.get(&oid(1)).unwrap().ref_count(), 2);
        let err = table.acquire_group(3, &[req(1, LockKind::Write)]).unwrap_err();
        assert_eq!(err.status(), Status::LockFailed);

        table.acquire_group(3, &[req(2, LockKind::Write)]).unwrap();
        assert!(table.acquire_group(1, &[req(2, LockKind::Read)]).is_err());
        table.verify().unwrap();
    }

    #[test]
    fn writer_may_reenter_its_own_lock() {
        let mut table = LockTable::new(16);
        table.acquire_group(4, &[req(9, LockKind::Write)]).unwrap();
        table
            .acquire_group(4, &[req(9, LockKind::Write), req(9, LockKind::Read)])
            .unwrap();
        let lock = table.get(&oid(9)).unwrap();
        assert_eq!(lock.ref_count(), 3);
        assert_eq!(lock.lock_kind, LockKind::Write);
        table.release_group(4, &[oid(9), oid(9)]).unwrap();
        assert_eq!(table.get(&oid(9)).unwrap().ref_count(), 1);
        table.release_group(4, &[oid(9)]).unwrap();
        assert!(table.get(&oid(9)).is_none());
    }

    #[test]
    fn sole_reader_can_upgrade_but_shared_reader_cannot() {
        let mut table = LockTable::new(16);
        table.acquire_group(1, &[req(5, LockKind::Read)]).unwrap();
        table.acquire_group(1, &[req(5, LockKind::Write)]).unwrap();
        assert_eq!(table.get(&oid(5)).unwrap().lock_kind, LockKind::Write);

        table.acquire_group(1, &[req(6, LockKind::Read)]).unwrap();
        table.acquire_group(2, &[req(6, LockKind::Read)]).unwrap();
        assert!(table.acquire_group(1, &[req(6, LockKind::Write)]).is_err());
    }

    #[test]
    fn releasing_the_upgrade_restores_shared_read() {
        let mut table = LockTable::new(16);
        table.acquire_group(1, &[req(5, LockKind::Read)]).unwrap();
        table.acquire_group(1, &[req(5, LockKind::Write)]).unwrap();
        assert!(table.acquire_group(2, &[req(5, LockKind::Read)]).is_err());

        table.release_group(1, &[oid(5)]).unwrap();
        let lock = table.get(&oid(5)).unwrap();
        assert_eq!(lock.lock_kind, LockKind::Read);
        assert_eq!(lock.ref_count(), 1);
        table.acquire_group(2, &[req(5, LockKind::Read)]).unwrap();
        table.verify().unwrap();

        // A lock taken as WRITE from the start stays WRITE while referenced.
        table
            .acquire_group(3, &[req(8, LockKind::Write), req(8, LockKind::Read)])
            .unwrap();
        table.release_group(3, &[oid(8)]).unwrap();
        assert_eq!(table.get(&oid(8)).unwrap().lock_kind, LockKind::Write);
    }

    #[test]
    fn failed_group_leaves_no_member_held() {
        let mut table = LockTable::new(16);
        table.acquire_group(7, &[req(2, LockKind::Write)]).unwrap();
        let group = [
            req(1, LockKind::Write),
            req(2, LockKind::Write),
            req(3, LockKind::Write),
        ];
        assert!(matches!(
            table.acquire_group(1, &group),
            Err(LockError::Conflict { owner: 7, .. })
        ));
        assert!(table.get(&oid(1)).is_none());
        assert!(table.get(&oid(3)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn capacity_is_checked_before_commit() {
        let mut table = LockTable::new(2);
        table.acquire_group(1, &[req(1, LockKind::Read)]).unwrap();
        let err = table
            .acquire_group(1, &[req(2, LockKind::Read), req(3, LockKind::Read)])
            .unwrap_err();
        assert_eq!(err.status(), Status::Oom);
        assert_eq!(table.len(), 1);
        table
            .acquire_group(2, &[req(1, LockKind::Read), req(2, LockKind::Read)])
            .unwrap();
    }

    #[test]
    fn release_group_validates_every_member_first() {
        let mut table = LockTable::new(16);
        table
            .acquire_group(1, &[req(1, LockKind::Write), req(2, LockKind::Write)])
            .unwrap();
        table.acquire_group(2, &[req(3, LockKind::Write)]).unwrap();

        let err = table.release_group(1, &[oid(1), oid(3)]).unwrap_err();
        assert_eq!(err.status(), Status::BadLock);
        let err = table.release_group(1, &[oid(1), oid(4)]).unwrap_err();
        assert_eq!(err.status(), Status::NoLock);
        let err = table.release_group(1, &[oid(2), oid(2)]).unwrap_err();
        assert_eq!(err.status(), Status::NoLock);
        assert!(table.get(&oid(1)).is_some());
        assert!(table.get(&oid(2)).is_some());

        table.release_group(1, &[oid(1), oid(2)]).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn owner_moves_to_remaining_reader() {
        let mut table = LockTable::new(16);
        table.acquire_group(3, &[req(1, LockKind::Read)]).unwrap();
        table.acquire_group(5, &[req(1, LockKind::Read)]).unwrap();
        table.release_group(3, &[oid(1)]).unwrap();
        let lock = table.get(&oid(1)).unwrap();
        assert_eq!(lock.owner_rank, 5);
        assert!(!lock.is_held_by(3));
        table.verify().unwrap();
    }

    #[test]
    fn release_rank_drops_leftover_references() {
        let mut table = LockTable::new(16);
        table.acquire_group(1, &[req(1, LockKind::Write)]).unwrap();
        table.acquire_group(1, &[req(2, LockKind::Read)]).unwrap();
        table.acquire_group(2, &[req(2, LockKind::Read)]).unwrap();
        assert_eq!(table.release_rank(1), 2);
        assert!(table.get(&oid(1)).is_none());
        assert_eq!(table.get(&oid(2)).unwrap().owner_rank, 2);
        table.verify().unwrap();
    }
}
