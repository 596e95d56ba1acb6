//! Entity store, units of work and repositories.
//!
//! # Responsibility
//! - Own entities in memory and serialize each write per table.
//! - Expose one generic repository contract for every entity type.
//! - Mirror committed units of work through a pluggable persistence boundary.
//!
//! # Invariants
//! - Repository writes go through a `UnitOfWork` and are journaled there.
//! - Repository APIs return semantic errors (`NotFound`,
//!   `OptimisticLockConflict`, ...) in addition to transport errors.

pub mod entity_repo;
pub mod member_repo;
pub mod store;
pub mod unit_of_work;

pub use entity_repo::{
    EntityRepository, QueryOutcome, ReadOnly, RepoError, RepoResult, StoreRepository,
};
pub use member_repo::MemberRepositoryCustom;
pub use store::{EntityStore, StoredEntity, Table};
pub use unit_of_work::{
    InMemoryBoundary, PendingWrite, PersistenceBoundary, UnitOfWork, UnitOfWorkId, UnitState,
};
