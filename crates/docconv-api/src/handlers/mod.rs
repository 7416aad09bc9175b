//! HTTP handlers for docconv-api.

pub mod health;
pub mod jobs;
