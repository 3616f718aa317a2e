//! Spreadsheet-driven bulk updates for CRM contacts and companies.
//!
//! An uploaded table is matched against CRM records, reviewed as a list of
//! pending field changes, applied in rate-limited batches and can be undone.
pub mod auth;
pub mod config;
pub mod crm;
pub mod db;
pub mod diff;
pub mod error;
pub mod executor;
pub mod extract;
pub mod jobs;
pub mod matcher;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod undo;
