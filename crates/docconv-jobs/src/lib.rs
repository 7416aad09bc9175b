//! # docconv-jobs
//!
//! Asynchronous conversion pipeline for docconv.
//!
//! This crate provides:
//! - A bounded worker pool that claims jobs, heartbeats their lease and
//!   records outcomes with exponential retry backoff
//! - A dispatcher routing each conversion type to its converter under a timeout
//! - Built-in converters wrapping LibreOffice, pandoc, pdftotext and tesseract
//! - The `JobService` used by the HTTP layer (enqueue, status, download,
//!   cancel, list)
//! - Lease reclaim and retention sweeps
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use docconv_db::MemoryJobStore;
//! use docconv_jobs::{builtin_dispatcher, CancelRegistry, JobService, ToolPaths, WorkerBuilder};
//!
//! let store = Arc::new(MemoryJobStore::new());
//! let dispatcher = builtin_dispatcher(&ToolPaths::from_env());
//! let cancellations = CancelRegistry::new();
//!
//! let handle = WorkerBuilder::new(store.clone())
//!     .with_dispatcher(dispatcher.clone())
//!     .with_cancellations(cancellations.clone())
//!     .build()
//!     .start();
//!
//! let service = JobService::new(store, Arc::new(dispatcher))
//!     .with_cancellations(cancellations);
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod cancel;
pub mod cleanup;
pub mod converters;
pub mod dispatcher;
pub mod reaper;
pub mod results;
pub mod retry;
pub mod service;
pub mod worker;

// Re-export core types
pub use docconv_core::*;

pub use cancel::CancelRegistry;
pub use cleanup::{input_cleanup_from_env, DeleteInput, RetainInput};
pub use converters::{builtin_dispatcher, ToolPaths};
pub use dispatcher::Dispatcher;
pub use reaper::{LeaseReaper, RetentionSweeper};
pub use results::{Download, ResultStore, StoredResult};
pub use retry::RetryPolicy;
pub use service::{CancelOutcome, EnqueueOptions, JobService, JobStatusView};
pub use worker::{WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};
