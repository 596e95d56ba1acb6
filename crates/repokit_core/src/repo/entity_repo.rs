//! Generic entity repository contract and its store-backed implementation.
//!
//! # Responsibility
//! - Provide CRUD, derived, specification, example, paged, locking and bulk
//!   operations over any stored entity type.
//! - Route every write through a unit of work so it can be rolled back.
//!
//! # Invariants
//! - Queries and shapes are validated before any entity is scanned.
//! - Write paths validate relation targets before mutating the store.
//! - Every returned entity is a detached copy; mutating it changes nothing
//!   until it is saved again.

use crate::db::DbError;
use crate::lock::{LockError, LockKey, LockMode, LockToken};
use crate::model::entity::{Entity, EntityId, EntityKind, ValidationError};
use crate::projection::{LoadPolicy, Projection, ProjectionError, ViewShape};
use crate::query::descriptor::validate_sort;
use crate::query::example::Example;
use crate::query::page::{paginate, sort_entities, Page, PageRequest};
use crate::query::specification::RelationResolver;
use crate::query::{
    derive_query, QueryAction, QueryArg, QueryDescriptor, QueryError, SortOrder, Specification,
};
use crate::repo::store::{EntityStore, StoredEntity};
use crate::repo::unit_of_work::{PendingWrite, UnitOfWork};
use log::{debug, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::ops::Deref;
use std::time::Instant;

pub type RepoResult<T> = Result<T, RepoError>;

/// Error for every repository, unit-of-work and projection operation.
#[derive(Debug)]
pub enum RepoError {
    /// Entity is transient (`id: None`) or no longer stored.
    NotFound {
        kind: EntityKind,
        id: Option<EntityId>,
    },
    /// Stale version on save.
    OptimisticLockConflict {
        kind: EntityKind,
        id: EntityId,
        expected: u64,
        actual: u64,
    },
    /// Row carries uncommitted writes of another open unit of work.
    UncommittedConflict { kind: EntityKind, id: EntityId },
    /// Entity breaks a field rule; nothing was stored.
    Validation(ValidationError),
    /// Required join with no related entity, or a dangling reference.
    JoinTargetMissing {
        relation: String,
        id: Option<EntityId>,
    },
    /// Example with no usable value after exclusions.
    EmptyExample,
    /// Single-result query matched more than one entity.
    NonUniqueResult { count: usize },
    /// Unit of work passed to a repository of another store.
    ForeignUnitOfWork,
    Query(QueryError),
    Lock(LockError),
    Projection(ProjectionError),
    Db(DbError),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { kind, id: Some(id) } => write!(f, "{kind} not found: {id}"),
            Self::NotFound { kind, id: None } => {
                write!(f, "{kind} has no identity; save it first")
            }
            Self::OptimisticLockConflict {
                kind,
                id,
                expected,
                actual,
            } => write!(
                f,
                "{kind} {id} was modified concurrently: stored version {expected}, given {actual}"
            ),
            Self::UncommittedConflict { kind, id } => write!(
                f,
                "{kind} {id} has uncommitted changes in another unit of work"
            ),
            Self::Validation(err) => write!(f, "{err}"),
            Self::JoinTargetMissing {
                relation,
                id: Some(id),
            } => write!(f, "relation `{relation}` points at missing entity {id}"),
            Self::JoinTargetMissing { relation, id: None } => {
                write!(f, "required relation `{relation}` is not set")
            }
            Self::EmptyExample => f.write_str("example has no value to match"),
            Self::NonUniqueResult { count } => {
                write!(f, "expected at most one result, found {count}")
            }
            Self::ForeignUnitOfWork => {
                f.write_str("unit of work belongs to a different entity store")
            }
            Self::Query(err) => write!(f, "{err}"),
            Self::Lock(err) => write!(f, "{err}"),
            Self::Projection(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Query(err) => Some(err),
            Self::Lock(err) => Some(err),
            Self::Projection(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<QueryError> for RepoError {
    fn from(value: QueryError) -> Self {
        Self::Query(value)
    }
}

impl From<ValidationError> for RepoError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<LockError> for RepoError {
    fn from(value: LockError) -> Self {
        Self::Lock(value)
    }
}

impl From<ProjectionError> for RepoError {
    fn from(value: ProjectionError) -> Self {
        Self::Projection(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Result of executing a descriptor, shaped by its action.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome<E> {
    Entities(Vec<E>),
    Count(usize),
    Exists(bool),
    Deleted(usize),
}

impl<E> QueryOutcome<E> {
    pub fn into_entities(self) -> Option<Vec<E>> {
        match self {
            Self::Entities(entities) => Some(entities),
            _ => None,
        }
    }

    /// Count, exists-as-0/1 or deleted count; `None` for entity results.
    pub fn count(&self) -> Option<usize> {
        match self {
            Self::Count(count) | Self::Deleted(count) => Some(*count),
            Self::Exists(exists) => Some(usize::from(*exists)),
            Self::Entities(_) => None,
        }
    }
}

/// Entity returned by a read-only query.
///
/// The wrapped copy is only reachable by shared reference, so it cannot be
/// edited and saved back by accident; `to_detached` makes an editable copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOnly<E>(E);

impl<E: Clone> ReadOnly<E> {
    pub fn to_detached(&self) -> E {
        self.0.clone()
    }
}

impl<E> Deref for ReadOnly<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.0
    }
}

/// Repository interface for one entity type.
///
/// Every call takes the unit of work it runs in; writes are journaled there.
pub trait EntityRepository<E: Entity> {
    /// Inserts a transient entity or merges a detached one.
    ///
    /// # Errors
    /// - `OptimisticLockConflict` when `entity.version()` is stale.
    /// - `NotFound` when merging an identity that is not stored.
    /// - `JoinTargetMissing` when a reference points at a missing entity.
    /// - `UncommittedConflict` when the row, or the entity it references, was
    ///   written by another unit of work that is still open.
    /// - `Validation` when a field rule is broken.
    fn save(&self, uow: &mut UnitOfWork<'_>, entity: E) -> RepoResult<E>;

    fn find_by_id(&self, uow: &UnitOfWork<'_>, id: EntityId) -> RepoResult<Option<E>>;

    fn find_all(&self, uow: &UnitOfWork<'_>) -> RepoResult<Vec<E>>;

    fn count(&self, uow: &UnitOfWork<'_>) -> RepoResult<usize>;

    /// # Errors
    /// - `NotFound` when the entity is transient or already deleted.
    fn delete(&self, uow: &mut UnitOfWork<'_>, entity: &E) -> RepoResult<()>;

    /// Filters, sorts and limits per `query`, ignoring its action.
    fn select(&self, uow: &UnitOfWork<'_>, query: &QueryDescriptor) -> RepoResult<Vec<E>>;

    /// Runs `query` then slices one page; a page sort overrides the query's.
    fn find_page(
        &self,
        uow: &UnitOfWork<'_>,
        query: &QueryDescriptor,
        page: &PageRequest,
    ) -> RepoResult<Page<E>>;

    /// Locks `id` in `mode` for the lifetime of `uow`.
    ///
    /// # Errors
    /// - `Lock(TargetMissing)` when the entity does not exist.
    /// - `Lock(Timeout)` per the configured `LockTimeout`.
    fn lock(&self, uow: &mut UnitOfWork<'_>, id: EntityId, mode: LockMode)
        -> RepoResult<LockToken>;

    /// Locks every match in identity order, then returns the matches as
    /// re-read under the locks.
    fn find_locked(
        &self,
        uow: &mut UnitOfWork<'_>,
        query: &QueryDescriptor,
        mode: LockMode,
    ) -> RepoResult<Vec<E>>;

    /// Applies `mutation` to every match directly in the store.
    ///
    /// Copies obtained earlier keep their old version and go stale. If any
    /// match fails, every row already updated by this call is put back.
    fn update_matching(
        &self,
        uow: &mut UnitOfWork<'_>,
        specification: &Specification,
        mutation: &dyn Fn(&mut E),
    ) -> RepoResult<usize>;

    fn project_with(
        &self,
        uow: &UnitOfWork<'_>,
        entities: &[E],
        shape: &ViewShape,
        policy: LoadPolicy,
    ) -> RepoResult<Vec<Projection>>;

    /// Projects with the store's configured load policy.
    fn project(
        &self,
        uow: &UnitOfWork<'_>,
        entities: &[E],
        shape: &ViewShape,
    ) -> RepoResult<Vec<Projection>>;

    /// Resolver for dereferencing deferred projections.
    fn resolver(&self) -> &dyn RelationResolver;

    fn exists_by_id(&self, uow: &UnitOfWork<'_>, id: EntityId) -> RepoResult<bool> {
        Ok(self.find_by_id(uow, id)?.is_some())
    }

    /// Deletes every entity; returns how many were removed.
    ///
    /// All or nothing: a failure puts back the rows already deleted.
    fn delete_all(&self, uow: &mut UnitOfWork<'_>) -> RepoResult<usize> {
        let entities = self.find_all(uow)?;
        uow.atomically(|uow| {
            for entity in &entities {
                self.delete(uow, entity)?;
            }
            Ok(entities.len())
        })
    }

    fn execute(
        &self,
        uow: &mut UnitOfWork<'_>,
        query: &QueryDescriptor,
    ) -> RepoResult<QueryOutcome<E>> {
        let matches = self.select(uow, query)?;
        let outcome = match query.action {
            QueryAction::Find => QueryOutcome::Entities(matches),
            QueryAction::Count => QueryOutcome::Count(matches.len()),
            QueryAction::Exists => QueryOutcome::Exists(!matches.is_empty()),
            QueryAction::Delete => uow.atomically(|uow| {
                for entity in &matches {
                    self.delete(uow, entity)?;
                }
                Ok(QueryOutcome::Deleted(matches.len()))
            })?,
        };
        Ok(outcome)
    }

    /// At most one match.
    ///
    /// # Errors
    /// - `NonUniqueResult` when more than one entity matches.
    fn find_one(&self, uow: &UnitOfWork<'_>, query: &QueryDescriptor) -> RepoResult<Option<E>> {
        let mut matches = self.select(uow, query)?;
        if matches.len() > 1 {
            return Err(RepoError::NonUniqueResult {
                count: matches.len(),
            });
        }
        Ok(matches.pop())
    }

    /// Runs `query` without a mutable unit of work; nothing is journaled.
    fn select_read_only(
        &self,
        uow: &UnitOfWork<'_>,
        query: &QueryDescriptor,
    ) -> RepoResult<Vec<ReadOnly<E>>> {
        Ok(self.select(uow, query)?.into_iter().map(ReadOnly).collect())
    }

    fn find_all_matching(
        &self,
        uow: &UnitOfWork<'_>,
        specification: &Specification,
    ) -> RepoResult<Vec<E>> {
        self.select(uow, &QueryDescriptor::find().restrict(specification.clone()))
    }

    fn count_matching(
        &self,
        uow: &UnitOfWork<'_>,
        specification: &Specification,
    ) -> RepoResult<usize> {
        Ok(self.find_all_matching(uow, specification)?.len())
    }

    /// # Errors
    /// - `EmptyExample` when the example has nothing left to match.
    fn find_by_example(&self, uow: &UnitOfWork<'_>, example: &Example<E>) -> RepoResult<Vec<E>> {
        self.find_all_matching(uow, &example.to_specification()?)
    }

    /// Derives a query from `method`, binds `args` and executes it.
    fn find_by_method(
        &self,
        uow: &mut UnitOfWork<'_>,
        method: &str,
        args: &[QueryArg],
    ) -> RepoResult<QueryOutcome<E>> {
        let query = derive_query::<E>(method)?.bind(args)?;
        self.execute(uow, &query)
    }
}

/// `EntityRepository` over one table of an `EntityStore`.
pub struct StoreRepository<'s, E> {
    store: &'s EntityStore,
    _entity: PhantomData<fn() -> E>,
}

impl<'s, E: StoredEntity> StoreRepository<'s, E> {
    pub fn new(store: &'s EntityStore) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    fn check_references(&self, uow: &UnitOfWork<'_>, entity: &E) -> RepoResult<()> {
        for relation in E::RELATIONS {
            let Some(id) = entity.reference(relation.name) else {
                continue;
            };
            if !self.store.contains(relation.target, id) {
                return Err(RepoError::JoinTargetMissing {
                    relation: relation.name.to_string(),
                    id: Some(id),
                });
            }
            // The target may still vanish if its writer rolls back.
            if self.store.claimed_by_other(relation.target, id, uow.id()) {
                return Err(RepoError::UncommittedConflict {
                    kind: relation.target,
                    id,
                });
            }
        }
        Ok(())
    }

    fn scan(
        &self,
        uow: &UnitOfWork<'_>,
        query: &QueryDescriptor,
        sort: &[SortOrder],
    ) -> RepoResult<Vec<E>> {
        uow.ensure_owner(self.store)?;
        query.validate::<E>()?;
        validate_sort::<E>(sort)?;

        let started_at = Instant::now();
        let specification = query.specification();
        let mut matches = Vec::new();
        for entity in E::table(self.store).snapshot() {
            if specification.matches(&entity, self.store)? {
                matches.push(entity);
            }
        }
        sort_entities(&mut matches, sort);
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        debug!(
            "event=query_scan module=repo status=ok kind={} matched={} duration_ms={}",
            E::KIND,
            matches.len(),
            started_at.elapsed().as_millis()
        );
        Ok(matches)
    }
}

impl<E: StoredEntity> EntityRepository<E> for StoreRepository<'_, E> {
    fn save(&self, uow: &mut UnitOfWork<'_>, entity: E) -> RepoResult<E> {
        uow.ensure_owner(self.store)?;
        self.check_references(uow, &entity)?;

        let (before, saved) = E::table(self.store).save(uow.id(), entity)?;
        let id = saved
            .id()
            .ok_or_else(|| RepoError::InvalidData(format!("saved {} has no identity", E::KIND)))?;
        uow.record(
            E::KIND,
            id,
            before.map(Entity::into_record),
            PendingWrite::Upsert(saved.clone().into_record()),
        );
        debug!(
            "event=entity_save module=repo status=ok kind={} id={id} version={}",
            E::KIND,
            saved.version()
        );
        Ok(saved)
    }

    fn find_by_id(&self, uow: &UnitOfWork<'_>, id: EntityId) -> RepoResult<Option<E>> {
        uow.ensure_owner(self.store)?;
        Ok(E::table(self.store).get(id))
    }

    fn find_all(&self, uow: &UnitOfWork<'_>) -> RepoResult<Vec<E>> {
        uow.ensure_owner(self.store)?;
        Ok(E::table(self.store).snapshot())
    }

    fn count(&self, uow: &UnitOfWork<'_>) -> RepoResult<usize> {
        uow.ensure_owner(self.store)?;
        Ok(E::table(self.store).len())
    }

    fn delete(&self, uow: &mut UnitOfWork<'_>, entity: &E) -> RepoResult<()> {
        uow.ensure_owner(self.store)?;
        let id = entity.id().ok_or(RepoError::NotFound {
            kind: E::KIND,
            id: None,
        })?;
        let before = E::table(self.store).remove(uow.id(), id)?;
        uow.record(
            E::KIND,
            id,
            Some(before.into_record()),
            PendingWrite::Delete { kind: E::KIND, id },
        );
        debug!(
            "event=entity_delete module=repo status=ok kind={} id={id}",
            E::KIND
        );
        Ok(())
    }

    fn select(&self, uow: &UnitOfWork<'_>, query: &QueryDescriptor) -> RepoResult<Vec<E>> {
        self.scan(uow, query, &query.sort)
    }

    fn find_page(
        &self,
        uow: &UnitOfWork<'_>,
        query: &QueryDescriptor,
        page: &PageRequest,
    ) -> RepoResult<Page<E>> {
        let sort = if page.sort().is_empty() {
            &query.sort
        } else {
            page.sort()
        };
        let matches = self.scan(uow, query, sort)?;
        Ok(paginate(matches, page))
    }

    fn lock(
        &self,
        uow: &mut UnitOfWork<'_>,
        id: EntityId,
        mode: LockMode,
    ) -> RepoResult<LockToken> {
        uow.ensure_owner(self.store)?;
        let key = LockKey::new(E::KIND, id);
        if !E::table(self.store).contains(id) {
            return Err(LockError::TargetMissing(key).into());
        }
        let token =
            self.store
                .locks()
                .acquire(key, mode, uow.id(), self.store.config().lock_timeout)?;
        uow.hold(token.clone());
        Ok(token)
    }

    fn find_locked(
        &self,
        uow: &mut UnitOfWork<'_>,
        query: &QueryDescriptor,
        mode: LockMode,
    ) -> RepoResult<Vec<E>> {
        let mut ids: Vec<EntityId> = self
            .select(uow, query)?
            .iter()
            .filter_map(Entity::id)
            .collect();
        ids.sort_unstable();

        let mut locked = Vec::with_capacity(ids.len());
        for id in ids {
            match self.lock(uow, id, mode) {
                Ok(_) => locked.push(id),
                // Deleted while we waited; it no longer matches.
                Err(RepoError::Lock(LockError::TargetMissing(_))) => {}
                Err(err) => return Err(err),
            }
        }

        let mut fresh = self.select(uow, query)?;
        fresh.retain(|entity| entity.id().is_some_and(|id| locked.contains(&id)));
        info!(
            "event=find_locked module=repo status=ok kind={} mode={mode:?} locked={}",
            E::KIND,
            locked.len()
        );
        Ok(fresh)
    }

    fn update_matching(
        &self,
        uow: &mut UnitOfWork<'_>,
        specification: &Specification,
        mutation: &dyn Fn(&mut E),
    ) -> RepoResult<usize> {
        let targets = self.find_all_matching(uow, specification)?;
        let table = E::table(self.store);
        let updated = uow.atomically(|uow| {
            let mut updated = 0usize;
            for id in targets.iter().filter_map(Entity::id) {
                let (before, after) = table.modify(uow.id(), id, mutation)?;
                uow.record(
                    E::KIND,
                    id,
                    Some(before.into_record()),
                    PendingWrite::Upsert(after.into_record()),
                );
                updated += 1;
            }
            Ok(updated)
        })?;
        info!(
            "event=bulk_update module=repo status=ok kind={} updated={updated}",
            E::KIND
        );
        Ok(updated)
    }

    fn project_with(
        &self,
        uow: &UnitOfWork<'_>,
        entities: &[E],
        shape: &ViewShape,
        policy: LoadPolicy,
    ) -> RepoResult<Vec<Projection>> {
        uow.ensure_owner(self.store)?;
        shape.validate::<E>()?;
        entities
            .iter()
            .map(|entity| Projection::project(entity, shape, policy, self.store))
            .collect()
    }

    fn project(
        &self,
        uow: &UnitOfWork<'_>,
        entities: &[E],
        shape: &ViewShape,
    ) -> RepoResult<Vec<Projection>> {
        self.project_with(uow, entities, shape, self.store.config().load_policy)
    }

    fn resolver(&self) -> &dyn RelationResolver {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityRepository, QueryOutcome, StoreRepository};
    use crate::config::EngineConfig;
    use crate::model::member::Member;
    use crate::model::team::Team;
    use crate::query::{Condition, QueryArg, QueryDescriptor};
    use crate::repo::store::EntityStore;
    use crate::repo::RepoError;

    #[test]
    fn save_rejects_reference_to_missing_team() {
        let store = EntityStore::new(EngineConfig::default());
        let members = StoreRepository::<Member>::new(&store);
        let mut uow = store.begin().unwrap();

        let mut member = Member::new("m1");
        member.team_id = Some(9);
        let err = members.save(&mut uow, member).unwrap_err();
        assert!(matches!(err, RepoError::JoinTargetMissing { id: Some(9), .. }));
        assert!(store.members().is_empty());
    }

    #[test]
    fn derived_delete_and_exists() {
        let store = EntityStore::new(EngineConfig::default());
        let members = StoreRepository::<Member>::new(&store);
        let mut uow = store.begin().unwrap();
        members.save(&mut uow, Member::with_age("a", 10)).unwrap();
        members.save(&mut uow, Member::with_age("b", 20)).unwrap();

        let exists = members
            .find_by_method(&mut uow, "existsByUsername", &[QueryArg::from("b")])
            .unwrap();
        assert_eq!(exists, QueryOutcome::Exists(true));

        let deleted = members
            .find_by_method(&mut uow, "deleteByAgeLessThan", &[QueryArg::from(15)])
            .unwrap();
        assert_eq!(deleted.count(), Some(1));
        assert_eq!(members.count(&uow).unwrap(), 1);
    }

    #[test]
    fn find_one_rejects_multiple_matches() {
        let store = EntityStore::new(EngineConfig::default());
        let members = StoreRepository::<Member>::new(&store);
        let mut uow = store.begin().unwrap();
        members.save(&mut uow, Member::new("dup")).unwrap();
        members.save(&mut uow, Member::new("dup")).unwrap();

        let query = QueryDescriptor::find().filter("username", Condition::eq("dup"));
        assert!(matches!(
            members.find_one(&uow, &query),
            Err(RepoError::NonUniqueResult { count: 2 })
        ));
    }

    #[test]
    fn delete_of_transient_entity_is_not_found() {
        let store = EntityStore::new(EngineConfig::default());
        let teams = StoreRepository::<Team>::new(&store);
        let mut uow = store.begin().unwrap();
        let err = teams.delete(&mut uow, &Team::new("ghost")).unwrap_err();
        assert!(matches!(err, RepoError::NotFound { id: None, .. }));
    }

    #[test]
    fn schema_mismatch_fails_before_scan() {
        let store = EntityStore::new(EngineConfig::default());
        let members = StoreRepository::<Member>::new(&store);
        let uow = store.begin().unwrap();
        let query = QueryDescriptor::find().filter("nickname", Condition::eq("x"));
        assert!(matches!(
            members.select(&uow, &query),
            Err(RepoError::Query(_))
        ));
    }
}
