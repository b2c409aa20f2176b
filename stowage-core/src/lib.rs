//! # Stowage Core
//!
//! Orchestration engine for the lifecycle of content-addressed files across
//! pluggable storage backends.
//!
//! ## Overview
//!
//! Callers submit batches of storage, deletion, copy and availability
//! requests. The engine:
//!
//! - **Deduplicates** requests per checksum and storage id, merging interest
//!   instead of repeating work
//! - **Catalogs** stored files as references carrying their owners
//! - **Dispatches** pending requests to backend plugins in working subsets
//! - **Tracks groups** so each batch gets exactly one completion event
//!
//! ## Architecture
//!
//! - [`repository`]: request, reference and group stores with in-memory
//!   implementations
//! - [`backend`]: the storage plugin contract and the storage id registry
//! - [`orchestration`]: admission, dispatch, jobs, completion and scheduling
//! - [`engine`]: the facade wiring all of the above for one tenant
//! - [`config`]: file and environment backed configuration
//!
//! ## Example
//!
//! ```no_run
//! use stowage_core::{EngineConfig, StorageEngine};
//!
//! # async fn run() -> stowage_core::Result<()> {
//! let engine = StorageEngine::builder(EngineConfig::load(None)?).build()?;
//! let report = engine.run_dispatch_cycle().await;
//! println!("scheduled {} jobs", report.job_count());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod repository;

pub use backend::{
    BackendFactory, BackendKind, BackendRegistry, StorageBackend, WorkingSubset,
};
pub use config::{BackendConfig, EngineConfig, SchedulerConfig};
pub use engine::{CycleReport, GroupAck, StorageEngine, StorageEngineBuilder, Stores};
pub use error::{Result, StorageError};
pub use orchestration::{
    CompletionReport, InMemoryLeaseLock, InProcEventBus, JobProgress,
    LeaseLock, LifecycleEventStream, LifecyclePublisher, PeriodicScheduler,
    StoredFile, TenantCycle,
};
pub use stowage_model as model;
