//! Units of work and the persistence boundary they write through.
//!
//! # Responsibility
//! - Track every write made through a unit of work so it can be undone.
//! - Stage pending writes at the persistence boundary on flush.
//! - Own the locks acquired on the unit's behalf.
//!
//! # Invariants
//! - A unit of work is bound to exactly one store.
//! - Rollback restores before-images in reverse write order.
//! - Locks and row claims are released when the unit ends, however it ends.
//! - Dropping an open unit rolls it back.

use crate::lock::LockToken;
use crate::model::entity::{EntityId, EntityKind, Record};
use crate::repo::entity_repo::{RepoError, RepoResult};
use crate::repo::store::EntityStore;
use log::{debug, error, warn};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type UnitOfWorkId = Uuid;

/// Write staged at the persistence boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Upsert(Record),
    Delete { kind: EntityKind, id: EntityId },
}

/// Durable side of the store.
///
/// The store itself is authoritative in memory; a boundary mirrors committed
/// units and supplies the initial contents on open.
pub trait PersistenceBoundary: Send + Sync {
    /// Records to seed a freshly opened store with.
    fn load(&self) -> RepoResult<Vec<Record>> {
        Ok(Vec::new())
    }

    fn begin(&self, uow: UnitOfWorkId) -> RepoResult<()>;

    /// Stages `writes` for `uow`; nothing becomes durable before commit.
    fn flush(&self, uow: UnitOfWorkId, writes: Vec<PendingWrite>) -> RepoResult<()>;

    fn commit(&self, uow: UnitOfWorkId) -> RepoResult<()>;

    fn rollback(&self, uow: UnitOfWorkId) -> RepoResult<()>;

    /// Called when the caller detaches its working set.
    fn clear(&self, _uow: UnitOfWorkId) -> RepoResult<()> {
        Ok(())
    }
}

/// Boundary that keeps nothing outside the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryBoundary;

impl PersistenceBoundary for InMemoryBoundary {
    fn begin(&self, _uow: UnitOfWorkId) -> RepoResult<()> {
        Ok(())
    }

    fn flush(&self, _uow: UnitOfWorkId, _writes: Vec<PendingWrite>) -> RepoResult<()> {
        Ok(())
    }

    fn commit(&self, _uow: UnitOfWorkId) -> RepoResult<()> {
        Ok(())
    }

    fn rollback(&self, _uow: UnitOfWorkId) -> RepoResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct JournalEntry {
    kind: EntityKind,
    id: EntityId,
    before: Option<Record>,
}

/// Transactional scope for repository calls.
///
/// Writes apply to the store immediately so later reads in any unit see
/// them; the journal lets `rollback` put the store back. Every written row
/// stays claimed by the unit until it ends, so no other unit can write over
/// an image that a rollback would later replace.
pub struct UnitOfWork<'s> {
    id: UnitOfWorkId,
    store: &'s EntityStore,
    state: UnitState,
    journal: Vec<JournalEntry>,
    pending: Vec<PendingWrite>,
    locks: Vec<LockToken>,
}

impl<'s> UnitOfWork<'s> {
    pub(crate) fn begin(store: &'s EntityStore) -> RepoResult<Self> {
        let id = Uuid::new_v4();
        store.boundary().begin(id)?;
        debug!("event=uow_begin module=repo status=ok uow={id}");
        Ok(Self {
            id,
            store,
            state: UnitState::Open,
            journal: Vec::new(),
            pending: Vec::new(),
            locks: Vec::new(),
        })
    }

    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn locks(&self) -> &[LockToken] {
        &self.locks
    }

    /// Writes not yet handed to the boundary.
    pub fn pending_writes(&self) -> &[PendingWrite] {
        &self.pending
    }

    pub(crate) fn store(&self) -> &'s EntityStore {
        self.store
    }

    /// Rejects units that belong to another store.
    pub(crate) fn ensure_owner(&self, store: &EntityStore) -> RepoResult<()> {
        if std::ptr::eq(self.store, store) {
            Ok(())
        } else {
            Err(RepoError::ForeignUnitOfWork)
        }
    }

    pub(crate) fn record(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        before: Option<Record>,
        write: PendingWrite,
    ) {
        self.journal.push(JournalEntry { kind, id, before });
        self.pending.push(write);
    }

    /// Runs a multi-row write as one step: if `work` fails, every write it
    /// journaled is undone before the error is returned.
    pub(crate) fn atomically<T>(
        &mut self,
        work: impl FnOnce(&mut Self) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let journal_mark = self.journal.len();
        let pending_mark = self.pending.len();
        let result = work(self);
        if let Err(err) = &result {
            let undone = self.undo_since(journal_mark);
            self.pending.truncate(pending_mark);
            warn!(
                "event=uow_partial_undo module=repo status=rolled_back uow={} undone={} error={err}",
                self.id,
                undone.len()
            );
            for (kind, id) in undone {
                let still_written = self
                    .journal
                    .iter()
                    .any(|entry| entry.kind == kind && entry.id == id);
                if !still_written {
                    self.store.release_claim(kind, id, self.id);
                }
            }
        }
        result
    }

    pub(crate) fn hold(&mut self, token: LockToken) {
        if !self.locks.contains(&token) {
            self.locks.push(token);
        }
    }

    /// Hands pending writes to the boundary. The unit stays open.
    pub fn flush(&mut self) -> RepoResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let writes = std::mem::take(&mut self.pending);
        let count = writes.len();
        self.store.boundary().flush(self.id, writes)?;
        debug!(
            "event=uow_flush module=repo status=ok uow={} writes={count}",
            self.id
        );
        Ok(())
    }

    /// Flushes, then detaches the working set.
    ///
    /// Every entity handed out by this unit is already a detached copy, so
    /// clearing only tells the boundary.
    pub fn clear(&mut self) -> RepoResult<()> {
        self.flush()?;
        self.store.boundary().clear(self.id)
    }

    /// Makes every write of this unit durable and releases its locks.
    ///
    /// A failed flush or commit leaves the unit open, so dropping it rolls
    /// back.
    pub fn commit(mut self) -> RepoResult<()> {
        self.flush()?;
        self.store.boundary().commit(self.id)?;
        self.state = UnitState::Committed;
        self.journal.clear();
        debug!("event=uow_commit module=repo status=ok uow={}", self.id);
        Ok(())
    }

    /// Undoes every write of this unit and releases its locks.
    pub fn rollback(mut self) -> RepoResult<()> {
        let undone = self.undo();
        self.store.boundary().rollback(self.id)?;
        debug!(
            "event=uow_rollback module=repo status=ok uow={} undone={undone}",
            self.id
        );
        Ok(())
    }

    fn undo(&mut self) -> usize {
        let undone = self.journal.len();
        self.undo_since(0);
        self.pending.clear();
        self.state = UnitState::RolledBack;
        undone
    }

    /// Restores journal entries past `mark`, newest first.
    fn undo_since(&mut self, mark: usize) -> BTreeSet<(EntityKind, EntityId)> {
        let mut touched = BTreeSet::new();
        while self.journal.len() > mark {
            let Some(entry) = self.journal.pop() else {
                break;
            };
            touched.insert((entry.kind, entry.id));
            self.store.restore(entry.kind, entry.id, entry.before);
        }
        touched
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if self.state == UnitState::Open {
            let undone = self.undo();
            warn!(
                "event=uow_drop module=repo status=rolled_back uow={} undone={undone}",
                self.id
            );
            if let Err(err) = self.store.boundary().rollback(self.id) {
                error!(
                    "event=uow_drop module=repo status=error uow={} error={err}",
                    self.id
                );
            }
        }
        self.store.release_claims(self.id);
        let released = self.store.locks().release_all(self.id);
        if released > 0 {
            debug!(
                "event=lock_release module=repo status=ok uow={} released={released}",
                self.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingWrite, UnitState};
    use crate::config::EngineConfig;
    use crate::model::entity::Entity;
    use crate::model::member::Member;
    use crate::repo::store::{EntityStore, StoredEntity};
    use crate::repo::RepoError;

    fn save_member(store: &EntityStore, uow: &mut super::UnitOfWork<'_>, name: &str) -> Member {
        let (before, saved) = Member::table(store)
            .save(uow.id(), Member::new(name))
            .unwrap();
        let id = saved.id().unwrap();
        uow.record(
            Member::KIND,
            id,
            before.map(Entity::into_record),
            PendingWrite::Upsert(saved.clone().into_record()),
        );
        saved
    }

    #[test]
    fn rollback_restores_before_images() {
        let store = EntityStore::new(EngineConfig::default());
        let mut uow = store.begin().unwrap();
        save_member(&store, &mut uow, "m1");
        assert_eq!(uow.pending_writes().len(), 1);
        uow.rollback().unwrap();
        assert!(store.members().is_empty());
    }

    #[test]
    fn dropping_open_unit_rolls_back() {
        let store = EntityStore::new(EngineConfig::default());
        {
            let mut uow = store.begin().unwrap();
            save_member(&store, &mut uow, "m1");
            assert_eq!(uow.state(), UnitState::Open);
        }
        assert!(store.members().is_empty());
    }

    #[test]
    fn commit_keeps_writes_and_flush_drains_pending() {
        let store = EntityStore::new(EngineConfig::default());
        let mut uow = store.begin().unwrap();
        save_member(&store, &mut uow, "m1");
        uow.flush().unwrap();
        assert!(uow.pending_writes().is_empty());
        uow.commit().unwrap();
        assert_eq!(store.members().len(), 1);
    }

    #[test]
    fn foreign_store_is_rejected() {
        let store = EntityStore::new(EngineConfig::default());
        let other = EntityStore::new(EngineConfig::default());
        let uow = store.begin().unwrap();
        assert!(matches!(
            uow.ensure_owner(&other),
            Err(RepoError::ForeignUnitOfWork)
        ));
        assert!(uow.ensure_owner(&store).is_ok());
    }

    #[test]
    fn failed_atomic_step_undoes_only_its_own_writes() {
        let store = EntityStore::new(EngineConfig::default());
        let mut uow = store.begin().unwrap();
        save_member(&store, &mut uow, "kept");

        let result: Result<(), RepoError> = uow.atomically(|uow| {
            save_member(&store, uow, "undone");
            Err(RepoError::EmptyExample)
        });
        assert!(matches!(result, Err(RepoError::EmptyExample)));
        assert_eq!(store.members().len(), 1);
        assert_eq!(uow.pending_writes().len(), 1);
        assert!(!store.members().claimed_by_other(2, uuid::Uuid::new_v4()));
        assert!(store.members().claimed_by_other(1, uuid::Uuid::new_v4()));
    }

    #[test]
    fn ending_a_unit_releases_its_row_claims() {
        let store = EntityStore::new(EngineConfig::default());
        let mut uow = store.begin().unwrap();
        save_member(&store, &mut uow, "m1");
        let observer = uuid::Uuid::new_v4();
        assert!(store.members().claimed_by_other(1, observer));
        uow.commit().unwrap();
        assert!(!store.members().claimed_by_other(1, observer));
    }
}
