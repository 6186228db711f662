//! Repositories for Gatekeeper persistence.
//!
//! Repositories are unit structs with static async methods over a
//! `&PgPool`; all queries use parameterized statements.

mod access_lists;
mod audit;
mod group_settings;
mod members;
mod sessions;

pub use access_lists::{AccessListsRepository, ListKind};
pub use audit::{AuditAction, AuditEvent, AuditRepository};
pub use group_settings::GroupSettingsRepository;
pub use members::MembersRepository;
pub use sessions::SessionsRepository;
