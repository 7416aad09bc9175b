//! # docconv-db
//!
//! Queue store implementations for docconv.
//!
//! This crate provides:
//! - Connection pool management
//! - `PgJobStore`, the durable PostgreSQL store shared by every process
//! - `MemoryJobStore`, a single-process store for development and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use docconv_db::{create_pool, JobStore, PgJobStore, NewJob, JobPayload, JobType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = create_pool("postgres://localhost/docconv").await?;
//!     let store = PgJobStore::new(pool);
//!
//!     let job = store
//!         .create(NewJob::new(JobType::OfficeToPdf, JobPayload::new("/srv/in/report.docx")))
//!         .await?;
//!
//!     println!("Queued job: {}", job.id);
//!     Ok(())
//! }
//! ```
pub mod jobs;
pub mod memory;
pub mod pool;

// Re-export core types
pub use docconv_core::*;

pub use jobs::PgJobStore;
pub use memory::MemoryJobStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};

