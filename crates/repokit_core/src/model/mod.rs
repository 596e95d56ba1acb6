//! Entity model for the member/team repository.
//!
//! # Responsibility
//! - Define the typed records owned by the entity store.
//! - Describe each entity's attribute and relation schema so queries can be
//!   validated before they touch any data.
//!
//! # Invariants
//! - Identity is assigned by the store and never changes afterwards.
//! - `version` increments on every successful mutation.

pub mod entity;
pub mod member;
pub mod team;
pub mod value;
