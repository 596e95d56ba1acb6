//! Member use-case service.
//!
//! # Responsibility
//! - Expose the named member queries callers rely on, each expressed as a
//!   derived method, explicit descriptor, specification or projection.
//! - Delegate every read and write to repository implementations.
//!
//! # Invariants
//! - Service APIs never bypass repository validation or journaling.
//! - The service stays storage-agnostic.

use crate::lock::LockMode;
use crate::model::entity::{EntityId, EntityKind};
use crate::model::member::{Member, TEAM_RELATION};
use crate::model::team::Team;
use crate::projection::{LoadPolicy, Projection, ViewShape};
use crate::query::{
    Condition, Page, PageRequest, QueryArg, QueryDescriptor, SortOrder, Specification,
};
use crate::repo::{
    EntityRepository, MemberRepositoryCustom, QueryOutcome, ReadOnly, RepoError, RepoResult,
    UnitOfWork,
};

/// Member row joined with its team name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDto {
    pub id: EntityId,
    pub username: String,
    pub team_name: String,
}

/// Member together with its eagerly fetched team.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberWithTeam {
    pub member: Member,
    pub team: Option<Team>,
}

/// Use-case service over member and team repositories.
pub struct MemberService<M, T> {
    members: M,
    teams: T,
}

impl<M, T> MemberService<M, T>
where
    M: EntityRepository<Member>,
    T: EntityRepository<Team>,
{
    pub fn new(members: M, teams: T) -> Self {
        Self { members, teams }
    }

    pub fn members(&self) -> &M {
        &self.members
    }

    pub fn teams(&self) -> &T {
        &self.teams
    }

    pub fn find_by_username(
        &self,
        uow: &mut UnitOfWork<'_>,
        username: &str,
    ) -> RepoResult<Vec<Member>> {
        self.derived(uow, "findByUsername", &[QueryArg::from(username)])
    }

    pub fn find_by_username_and_age_greater_than(
        &self,
        uow: &mut UnitOfWork<'_>,
        username: &str,
        age: i64,
    ) -> RepoResult<Vec<Member>> {
        self.derived(
            uow,
            "findByUsernameAndAgeGreaterThan",
            &[QueryArg::from(username), QueryArg::from(age)],
        )
    }

    /// First three members in identity order.
    pub fn find_top3(&self, uow: &mut UnitOfWork<'_>) -> RepoResult<Vec<Member>> {
        self.derived(uow, "findTop3By", &[])
    }

    /// Exact username and age, as an explicit descriptor.
    pub fn find_user(
        &self,
        uow: &UnitOfWork<'_>,
        username: &str,
        age: i64,
    ) -> RepoResult<Vec<Member>> {
        let query = QueryDescriptor::find()
            .filter("username", Condition::eq(username))
            .filter("age", Condition::eq(age));
        self.members.select(uow, &query)
    }

    pub fn find_by_names(
        &self,
        uow: &mut UnitOfWork<'_>,
        names: &[&str],
    ) -> RepoResult<Vec<Member>> {
        self.derived(uow, "findByUsernameIn", &[QueryArg::from(names.to_vec())])
    }

    /// # Errors
    /// - `NonUniqueResult` when several members share `username`.
    pub fn find_optional_by_username(
        &self,
        uow: &UnitOfWork<'_>,
        username: &str,
    ) -> RepoResult<Option<Member>> {
        let query = QueryDescriptor::find().filter("username", Condition::eq(username));
        self.members.find_one(uow, &query)
    }

    pub fn find_by_age(
        &self,
        uow: &UnitOfWork<'_>,
        age: i64,
        page: &PageRequest,
    ) -> RepoResult<Page<Member>> {
        let query = QueryDescriptor::find().filter("age", Condition::eq(age));
        self.members.find_page(uow, &query, page)
    }

    pub fn find_username_list(&self, uow: &UnitOfWork<'_>) -> RepoResult<Vec<String>> {
        let members = self.members.find_all(uow)?;
        let views = self
            .members
            .project(uow, &members, &ViewShape::of(["username"]))?;
        Ok(views
            .iter()
            .filter_map(|view| view.text("username").map(str::to_string))
            .collect())
    }

    /// Members that belong to a team, with the team name joined in.
    pub fn find_member_dto(&self, uow: &UnitOfWork<'_>) -> RepoResult<Vec<MemberDto>> {
        let members = self.members.find_all(uow)?;
        let shape = ViewShape::of(["id", "username"])
            .with_nested(TEAM_RELATION, ViewShape::of(["name"]));
        let views = self
            .members
            .project_with(uow, &members, &shape, LoadPolicy::EagerJoin)?;

        let mut rows = Vec::new();
        for view in &views {
            let Some(team) = view.related(TEAM_RELATION, self.members.resolver())? else {
                continue;
            };
            let (Some(id), Some(username), Some(team_name)) =
                (view.int("id"), view.text("username"), team.text("name"))
            else {
                continue;
            };
            let id = EntityId::try_from(id)
                .map_err(|_| RepoError::InvalidData(format!("invalid member identity {id}")))?;
            rows.push(MemberDto {
                id,
                username: username.to_string(),
                team_name: team_name.to_string(),
            });
        }
        Ok(rows)
    }

    /// Increments the age of every member at least `age` years old.
    pub fn bulk_age_plus(&self, uow: &mut UnitOfWork<'_>, age: i64) -> RepoResult<usize> {
        let adults = Specification::attribute("age", Condition::GreaterThanEqual(age.into()));
        self.members
            .update_matching(uow, &adults, &|member: &mut Member| member.age += 1)
    }

    /// Members named `username`, each fetched together with its team.
    ///
    /// # Errors
    /// - `JoinTargetMissing` when a member references a deleted team.
    pub fn find_with_team(
        &self,
        uow: &mut UnitOfWork<'_>,
        username: &str,
    ) -> RepoResult<Vec<MemberWithTeam>> {
        let members = self.find_by_username(uow, username)?;
        let uow: &UnitOfWork<'_> = uow;
        members
            .into_iter()
            .map(|member| {
                let team = match member.team_id {
                    Some(id) => Some(self.teams.find_by_id(uow, id)?.ok_or_else(|| {
                        RepoError::JoinTargetMissing {
                            relation: TEAM_RELATION.to_string(),
                            id: Some(id),
                        }
                    })?),
                    None => None,
                };
                Ok(MemberWithTeam { member, team })
            })
            .collect()
    }

    /// Members named `username`, exclusively locked until `uow` ends.
    pub fn find_lock_by_username(
        &self,
        uow: &mut UnitOfWork<'_>,
        username: &str,
    ) -> RepoResult<Vec<Member>> {
        let query = QueryDescriptor::find().filter("username", Condition::eq(username));
        self.members.find_locked(uow, &query, LockMode::Exclusive)
    }

    /// Members named `username` as read-only copies; nothing is journaled.
    pub fn find_read_only_by_username(
        &self,
        uow: &UnitOfWork<'_>,
        username: &str,
    ) -> RepoResult<Vec<ReadOnly<Member>>> {
        let query = QueryDescriptor::find().filter("username", Condition::eq(username));
        self.members.select_read_only(uow, &query)
    }

    pub fn find_projections_by_username(
        &self,
        uow: &UnitOfWork<'_>,
        username: &str,
        shape: &ViewShape,
    ) -> RepoResult<Vec<Projection>> {
        let query = QueryDescriptor::find().filter("username", Condition::eq(username));
        let members = self.members.select(uow, &query)?;
        self.members.project(uow, &members, shape)
    }

    /// Members of `team`, in username order.
    pub fn find_by_team(&self, uow: &UnitOfWork<'_>, team: &Team) -> RepoResult<Vec<Member>> {
        let team_id = team.id.ok_or(RepoError::NotFound {
            kind: EntityKind::Team,
            id: None,
        })?;
        let query = QueryDescriptor::find()
            .restrict(Specification::references(TEAM_RELATION, team_id))
            .order_by(SortOrder::asc("username"));
        self.members.select(uow, &query)
    }

    fn derived(
        &self,
        uow: &mut UnitOfWork<'_>,
        method: &str,
        args: &[QueryArg],
    ) -> RepoResult<Vec<Member>> {
        match self.members.find_by_method(uow, method, args)? {
            QueryOutcome::Entities(members) => Ok(members),
            other => Err(RepoError::InvalidData(format!(
                "`{method}` returned {other:?} instead of entities"
            ))),
        }
    }
}

impl<M, T> MemberService<M, T>
where
    M: EntityRepository<Member> + MemberRepositoryCustom,
    T: EntityRepository<Team>,
{
    pub fn find_member_custom(&self, uow: &UnitOfWork<'_>) -> RepoResult<Vec<Member>> {
        self.members.find_member_custom(uow)
    }
}
