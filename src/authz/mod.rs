//! Role-based authorization with record scopes and field-level narrowing.
//!
//! [`registry::Registry`] keeps an immutable snapshot of roles and grants loaded from
//! the backing store; [`engine::AuthorizationEngine`] evaluates decisions against it
//! without I/O; [`filter`] applies `AllowFiltered` decisions to records and payloads.
//! Seed data can be declared in KDL files ([`policy`], [`loader`]).

pub mod engine;
pub mod errors;
pub mod filter;
pub mod loader;
pub mod policy;
pub mod registry;
pub mod types;
pub mod web;

pub use engine::{AuthorizationEngine, EngineOptions};
pub use registry::{Registry, RoleInheritance};
pub use types::{Decision, FieldAccess, FieldPermissions, Operation, Permission, Scope};
