//! Core engine for Lumen canvases.
//!
//! This crate provides:
//! - Persistent interpreter sessions speaking a line protocol
//! - Correlation of concurrent executions by ID, with per-call deadlines
//! - A registry guaranteeing one process per session key
//! - Reconciliation of execution outputs against previously shown slots
//! - Result caching, artifact storage and periodic cleanup

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod sweeper;

pub use artifacts::ArtifactStore;
pub use cache::ResultCache;
pub use config::LumenConfig;
pub use error::{Error, Result};
pub use model::{Artifact, ArtifactKind, ExecuteRequest, ExecuteResponse, ExecutionRequest, ExecutionResult};
pub use protocol::{Frame, FrameDecoder, LineDecoder};
pub use reconcile::{Anchor, Assignment, BindingStore, Reconciler, Reconciliation, Slot};
pub use service::ExecutionService;
pub use session::{
    CommandSpawner, ExecutionCorrelator, Session, SessionRegistry, SessionState, SpawnedProcess, Spawner,
};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
