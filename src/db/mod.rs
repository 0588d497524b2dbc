//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `wa_courier::db`, which re-exports
//! the repository API and the commonly used view models.

pub mod model;
pub mod repo;

// Re-export the repository API at `crate::db::*` for convenience.
pub use repo::*;

// Surface view models used by callers (workers, webhook pipeline).
pub use model::{
    AckTarget, CampaignDispatch, ContactRef, DeliveryDispatch, DeliveryForDispatch, FailedJob,
    NewCampaignRow, NewMessageRow,
};
