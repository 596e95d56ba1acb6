//! Core of the repokit repository query engine.
//!
//! Entities live in an in-memory `EntityStore`; repositories run derived,
//! specification, example and paged queries against it inside units of work,
//! and a persistence boundary mirrors committed work to SQLite.

pub mod config;
pub mod db;
pub mod lock;
pub mod logging;
pub mod model;
pub mod projection;
pub mod query;
pub mod repo;
pub mod service;

pub use config::{ConfigError, EngineConfig};
pub use db::{DbError, SqliteBoundary};
pub use lock::{LockCoordinator, LockError, LockKey, LockMode, LockTimeout, LockToken};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::entity::{Entity, EntityId, EntityKind, Record, ValidationError};
pub use model::member::Member;
pub use model::team::Team;
pub use model::value::{AttrKind, AttrValue};
pub use projection::{LoadPolicy, Projection, ProjectionError, ViewShape};
pub use query::{
    derive_query, Condition, Example, ExampleMatcher, Page, PageRequest, QueryArg,
    QueryDescriptor, QueryError, QueryTemplate, SortOrder, Specification, StringMatcher,
};
pub use repo::{
    EntityRepository, EntityStore, MemberRepositoryCustom, PersistenceBoundary, QueryOutcome,
    ReadOnly, RepoError, RepoResult, StoreRepository, UnitOfWork,
};
pub use service::member_service::{MemberDto, MemberService, MemberWithTeam};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
