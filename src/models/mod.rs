//! Core data models for the asset upload service.
//!
//! Persistent entities map to SQLite tables via `sqlx::FromRow`; the file
//! types describe what moves across a session (incoming entries, listed files).

pub mod bucket;
pub mod file;
pub mod object;
pub mod project;
pub mod user;
