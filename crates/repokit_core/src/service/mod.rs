//! Use-case services over the repository layer.
//!
//! # Responsibility
//! - Compose repository operations into named member queries.
//!
//! # Invariants
//! - Services depend on repository traits, never on the store directly.

pub mod member_service;

pub use member_service::{MemberDto, MemberService, MemberWithTeam};
