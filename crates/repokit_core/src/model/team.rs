//! Team (group) entity.
//!
//! # Invariants
//! - A team never stores its member list; membership is looked up through
//!   `Member.team_id`.

use crate::model::entity::{
    id_value, AttributeDef, Entity, EntityId, EntityKind, Record, RelationDef, ValidationError,
};
use crate::model::value::{AttrKind, AttrValue};
use serde::{Deserialize, Serialize};

pub(crate) const TEAM_ATTRIBUTES: &[AttributeDef] = &[
    AttributeDef {
        name: "id",
        kind: AttrKind::Int,
    },
    AttributeDef {
        name: "name",
        kind: AttrKind::Text,
    },
];

/// Named group that members can belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: Option<EntityId>,
    pub version: u64,
    pub name: String,
}

impl Team {
    /// Creates a transient team; the store assigns identity on save.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            version: 0,
            name: name.into(),
        }
    }
}

impl Entity for Team {
    const KIND: EntityKind = EntityKind::Team;
    const ATTRIBUTES: &'static [AttributeDef] = TEAM_ATTRIBUTES;
    const RELATIONS: &'static [RelationDef] = &[];

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
            "name" => Some(AttrValue::Text(self.name.clone())),
            _ => None,
        }
    }

    fn reference(&self, _relation: &str) -> Option<EntityId> {
        None
    }

    fn into_record(self) -> Record {
        Record::Team(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Team(team) => Some(team),
            Record::Member(_) => None,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::BlankField {
                kind: Self::KIND,
                field: "name",
            });
        }
        Ok(())
    }
}
