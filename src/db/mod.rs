//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: insert payloads and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Every read-modify-write runs inside one transaction, and session status
//! changes are compare-and-set, so several workers may share one pool.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{EditOutcome, EntryEdit, NewEntry, NewSession, SessionSummary};
