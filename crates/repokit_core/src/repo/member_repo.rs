//! Hand-written member queries layered over the generic repository.
//!
//! # Responsibility
//! - Host member queries that are not derived from a method name.
//!
//! # Invariants
//! - Fragment methods read through the same unit of work as the generic
//!   repository and never write.

use crate::model::member::Member;
use crate::query::QueryDescriptor;
use crate::repo::entity_repo::{EntityRepository, RepoResult, StoreRepository};
use crate::repo::unit_of_work::UnitOfWork;
use log::debug;

/// Custom fragment implemented next to `EntityRepository<Member>`.
pub trait MemberRepositoryCustom {
    /// Every member in identity order.
    fn find_member_custom(&self, uow: &UnitOfWork<'_>) -> RepoResult<Vec<Member>>;
}

impl MemberRepositoryCustom for StoreRepository<'_, Member> {
    fn find_member_custom(&self, uow: &UnitOfWork<'_>) -> RepoResult<Vec<Member>> {
        let members = self.select(uow, &QueryDescriptor::find())?;
        debug!(
            "event=member_custom module=repo status=ok count={}",
            members.len()
        );
        Ok(members)
    }
}
