//! Database module: entity mapping and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned to the dispatch worker.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! External modules should import from `draftdeck::db` — we re-export the
//! repository API and the view models for convenience.

pub mod model;
pub mod repo;

pub use model::{DraftForPublish, DuePublication, PublishPost};
pub use repo::*;
