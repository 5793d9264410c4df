//! Resume extraction
//!
//! Turns free-text resumes into structured candidate records by prompting an
//! LLM completion service, either one record at a time or through its batch
//! facility, and persists the validated fields into PostgreSQL.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod telemetry;
