//! Member entity.
//!
//! # Invariants
//! - `team_id` is a lookup link only; deleting a team does not cascade.

use crate::model::entity::{
    id_value, AttributeDef, Entity, EntityId, EntityKind, Record, RelationDef, ValidationError,
};
use crate::model::team::{Team, TEAM_ATTRIBUTES};
use crate::model::value::{AttrKind, AttrValue};
use serde::{Deserialize, Serialize};

/// Relation name used by member queries and projections.
pub const TEAM_RELATION: &str = "team";

/// A person with a username, an age and an optional team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Option<EntityId>,
    pub version: u64,
    pub username: String,
    pub age: i64,
    pub team_id: Option<EntityId>,
}

impl Member {
    /// Creates a transient member with age 0 and no team.
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_age(username, 0)
    }

    pub fn with_age(username: impl Into<String>, age: i64) -> Self {
        Self {
            id: None,
            version: 0,
            username: username.into(),
            age,
            team_id: None,
        }
    }

    /// Creates a transient member that references `team`.
    ///
    /// The reference stays absent when `team` has not been saved yet.
    pub fn in_team(username: impl Into<String>, age: i64, team: &Team) -> Self {
        let mut member = Self::with_age(username, age);
        member.change_team(team);
        member
    }

    pub fn change_team(&mut self, team: &Team) {
        self.team_id = team.id;
    }

    pub fn leave_team(&mut self) {
        self.team_id = None;
    }
}

impl Entity for Member {
    const KIND: EntityKind = EntityKind::Member;
    const ATTRIBUTES: &'static [AttributeDef] = &[
        AttributeDef {
            name: "id",
            kind: AttrKind::Int,
        },
        AttributeDef {
            name: "username",
            kind: AttrKind::Text,
        },
        AttributeDef {
            name: "age",
            kind: AttrKind::Int,
        },
    ];
    const RELATIONS: &'static [RelationDef] = &[RelationDef {
        name: TEAM_RELATION,
        target: EntityKind::Team,
        attributes: TEAM_ATTRIBUTES,
    }];

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn attribute(&self, name: &str) -> Option<AttrValue> {
        match name {
            "id" => self.id.and_then(id_value),
            "username" => Some(AttrValue::Text(self.username.clone())),
            "age" => Some(AttrValue::Int(self.age)),
            _ => None,
        }
    }

    fn reference(&self, relation: &str) -> Option<EntityId> {
        match relation {
            TEAM_RELATION => self.team_id,
            _ => None,
        }
    }

    fn into_record(self) -> Record {
        Record::Member(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Member(member) => Some(member),
            Record::Team(_) => None,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.username.trim().is_empty() {
            return Err(ValidationError::BlankField {
                kind: Self::KIND,
                field: "username",
            });
        }
        if self.age < 0 {
            return Err(ValidationError::NegativeValue {
                kind: Self::KIND,
                field: "age",
                value: self.age,
            });
        }
        Ok(())
    }
}
