//! In-memory entity tables and the store that owns them.
//!
//! # Responsibility
//! - Own every entity exclusively, one table per entity kind.
//! - Make each save/remove/read individually atomic.
//! - Hand out units of work and resolve relation lookups.
//!
//! # Invariants
//! - Identities are unique per table and never reused.
//! - A failed write leaves the table unchanged.
//! - A row written by an open unit of work can only be written again by that
//!   unit until it commits or rolls back.

use crate::config::EngineConfig;
use crate::lock::LockCoordinator;
use crate::model::entity::{Entity, EntityId, EntityKind, Record};
use crate::model::member::Member;
use crate::model::team::Team;
use crate::model::value::AttributeMap;
use crate::query::specification::RelationResolver;
use crate::repo::entity_repo::{RepoError, RepoResult};
use crate::repo::unit_of_work::{InMemoryBoundary, PersistenceBoundary, UnitOfWork, UnitOfWorkId};
use log::info;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct TableState<E> {
    rows: BTreeMap<EntityId, E>,
    /// Rows carrying uncommitted writes, keyed to the writing unit.
    claims: HashMap<EntityId, UnitOfWorkId>,
}

impl<E: Entity> TableState<E> {
    fn ensure_unclaimed(&self, id: EntityId, owner: UnitOfWorkId) -> RepoResult<()> {
        match self.claims.get(&id) {
            Some(holder) if *holder != owner => Err(RepoError::UncommittedConflict {
                kind: E::KIND,
                id,
            }),
            _ => Ok(()),
        }
    }
}

/// Identity-ordered rows of one entity kind.
pub struct Table<E> {
    state: RwLock<TableState<E>>,
    sequence: AtomicU64,
}

impl<E: Entity> Table<E> {
    fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                rows: BTreeMap::new(),
                claims: HashMap::new(),
            }),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().rows.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.read().rows.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<E> {
        self.read().rows.get(&id).cloned()
    }

    /// Copies every row in identity order.
    pub fn snapshot(&self) -> Vec<E> {
        self.read().rows.values().cloned().collect()
    }

    /// Whether `id` carries uncommitted writes of a unit other than `owner`.
    pub fn claimed_by_other(&self, id: EntityId, owner: UnitOfWorkId) -> bool {
        self.read()
            .claims
            .get(&id)
            .is_some_and(|holder| *holder != owner)
    }

    /// Inserts a transient entity or merges an existing one by identity.
    ///
    /// Returns the previous image (if any) and the stored image.
    pub(crate) fn save(&self, owner: UnitOfWorkId, mut entity: E) -> RepoResult<(Option<E>, E)> {
        entity.validate()?;
        let mut state = self.write();
        let Some(id) = entity.id() else {
            let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            entity.assign_id(id);
            entity.set_version(0);
            state.rows.insert(id, entity.clone());
            state.claims.insert(id, owner);
            return Ok((None, entity));
        };

        state.ensure_unclaimed(id, owner)?;
        let current = state.rows.get(&id).ok_or(RepoError::NotFound {
            kind: E::KIND,
            id: Some(id),
        })?;
        if current.version() != entity.version() {
            return Err(RepoError::OptimisticLockConflict {
                kind: E::KIND,
                id,
                expected: current.version(),
                actual: entity.version(),
            });
        }
        entity.set_version(current.version() + 1);
        let before = state.rows.insert(id, entity.clone());
        state.claims.insert(id, owner);
        Ok((before, entity))
    }

    /// Applies `mutation` to a copy of the row and stores it if still valid.
    ///
    /// Identity is preserved and the version bumped.
    pub(crate) fn modify(
        &self,
        owner: UnitOfWorkId,
        id: EntityId,
        mutation: &dyn Fn(&mut E),
    ) -> RepoResult<(E, E)> {
        let mut state = self.write();
        state.ensure_unclaimed(id, owner)?;
        let before = state.rows.get(&id).cloned().ok_or(RepoError::NotFound {
            kind: E::KIND,
            id: Some(id),
        })?;
        let mut after = before.clone();
        mutation(&mut after);
        after.assign_id(id);
        after.set_version(before.version() + 1);
        after.validate()?;
        state.rows.insert(id, after.clone());
        state.claims.insert(id, owner);
        Ok((before, after))
    }

    pub(crate) fn remove(&self, owner: UnitOfWorkId, id: EntityId) -> RepoResult<E> {
        let mut state = self.write();
        state.ensure_unclaimed(id, owner)?;
        let removed = state.rows.remove(&id).ok_or(RepoError::NotFound {
            kind: E::KIND,
            id: Some(id),
        })?;
        state.claims.insert(id, owner);
        Ok(removed)
    }

    /// Puts back a journaled image, or removes the row when there was none.
    pub(crate) fn restore(&self, id: EntityId, before: Option<E>) {
        let mut state = self.write();
        match before {
            Some(entity) => {
                state.rows.insert(id, entity);
            }
            None => {
                state.rows.remove(&id);
            }
        }
    }

    /// Drops `owner`'s claim on `id`.
    pub(crate) fn release(&self, id: EntityId, owner: UnitOfWorkId) {
        let mut state = self.write();
        if state.claims.get(&id) == Some(&owner) {
            state.claims.remove(&id);
        }
    }

    /// Drops every claim of `owner`; returns how many rows it had claimed.
    pub(crate) fn release_all(&self, owner: UnitOfWorkId) -> usize {
        let mut state = self.write();
        let claimed = state.claims.len();
        state.claims.retain(|_, holder| *holder != owner);
        claimed - state.claims.len()
    }

    /// Inserts a persisted entity, keeping the id sequence ahead of it.
    fn load(&self, entity: E) -> RepoResult<()> {
        let id = entity.id().ok_or_else(|| {
            RepoError::InvalidData(format!("persisted {} has no identity", E::KIND))
        })?;
        self.sequence.fetch_max(id, Ordering::SeqCst);
        self.write().rows.insert(id, entity);
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, TableState<E>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState<E>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entity types that have a table in `EntityStore`.
pub trait StoredEntity: Entity {
    fn table(store: &EntityStore) -> &Table<Self>;
}

impl StoredEntity for Member {
    fn table(store: &EntityStore) -> &Table<Self> {
        &store.members
    }
}

impl StoredEntity for Team {
    fn table(store: &EntityStore) -> &Table<Self> {
        &store.teams
    }
}

/// Owner of all entity tables, the lock coordinator and the persistence
/// boundary.
pub struct EntityStore {
    config: EngineConfig,
    members: Table<Member>,
    teams: Table<Team>,
    locks: LockCoordinator,
    boundary: Box<dyn PersistenceBoundary>,
}

impl EntityStore {
    /// Creates an empty store backed by the no-op in-memory boundary.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            members: Table::new(),
            teams: Table::new(),
            locks: LockCoordinator::new(),
            boundary: Box::new(InMemoryBoundary),
        }
    }

    /// Creates a store over `boundary`, loading whatever it already holds.
    pub fn open(
        config: EngineConfig,
        boundary: impl PersistenceBoundary + 'static,
    ) -> RepoResult<Self> {
        let mut store = Self::new(config);
        let records = boundary.load()?;
        let loaded = records.len();
        for record in records {
            match record {
                Record::Member(member) => store.members.load(member)?,
                Record::Team(team) => store.teams.load(team)?,
            }
        }
        store.boundary = Box::new(boundary);
        info!("event=store_open module=repo status=ok loaded={loaded}");
        Ok(store)
    }

    /// Opens a new unit of work bound to this store.
    pub fn begin(&self) -> RepoResult<UnitOfWork<'_>> {
        UnitOfWork::begin(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn members(&self) -> &Table<Member> {
        &self.members
    }

    pub fn teams(&self) -> &Table<Team> {
        &self.teams
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        match kind {
            EntityKind::Member => self.members.contains(id),
            EntityKind::Team => self.teams.contains(id),
        }
    }

    pub(crate) fn boundary(&self) -> &dyn PersistenceBoundary {
        self.boundary.as_ref()
    }

    pub(crate) fn restore(&self, kind: EntityKind, id: EntityId, before: Option<Record>) {
        match kind {
            EntityKind::Member => self
                .members
                .restore(id, before.and_then(Member::from_record)),
            EntityKind::Team => self.teams.restore(id, before.and_then(Team::from_record)),
        }
    }

    pub(crate) fn claimed_by_other(
        &self,
        kind: EntityKind,
        id: EntityId,
        owner: UnitOfWorkId,
    ) -> bool {
        match kind {
            EntityKind::Member => self.members.claimed_by_other(id, owner),
            EntityKind::Team => self.teams.claimed_by_other(id, owner),
        }
    }

    pub(crate) fn release_claim(&self, kind: EntityKind, id: EntityId, owner: UnitOfWorkId) {
        match kind {
            EntityKind::Member => self.members.release(id, owner),
            EntityKind::Team => self.teams.release(id, owner),
        }
    }

    /// Releases every row claim of `owner`.
    pub(crate) fn release_claims(&self, owner: UnitOfWorkId) -> usize {
        self.members.release_all(owner) + self.teams.release_all(owner)
    }
}

impl RelationResolver for EntityStore {
    fn resolve(&self, kind: EntityKind, id: EntityId) -> Option<AttributeMap> {
        match kind {
            EntityKind::Member => self.members.get(id).map(|member| member.attributes()),
            EntityKind::Team => self.teams.get(id).map(|team| team.attributes()),
        }
    }
}
