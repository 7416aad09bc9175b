//! # docconv-core
//!
//! Core types, traits, and abstractions for the docconv conversion queue.
//!
//! This crate provides the job record, the job state machine, and the trait
//! seams (`JobStore`, `Converter`, `InputCleanup`) that the store, worker and
//! API crates depend on.

pub mod defaults;
pub mod error;
pub mod models;
pub mod state;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
