//! Deployment job controller for the larch platform.
//!
//! This crate manages the lifecycle of deployment and test jobs for tenant
//! applications: for each (application, job type) pair it keeps a
//! monotonically numbered history of runs, drives each run through the
//! ordered steps of its profile, buffers run logs and test reports, and
//! garbage-collects the data of removed applications.
//!
//! # Architecture
//!
//! ```text
//! callers (REST handler, periodic sweep, step executors)
//!          |
//!          v
//!    JobController ───────► runner callback (drives the executor)
//!     |    |    |
//!     |    |    +──► ExternalAdapters (config server, tester cloud,
//!     |    |                           artifact store, versions, clock)
//!     |    +──► LockService (per-job and per-step advisory locks)
//!     v
//!  RunStore / BufferedLogStore / ApplicationStore
//!          |
//!          v
//!    KeyValueStore (larch-core)
//! ```
//!
//! The controller holds no state of its own beyond the write-once runner
//! slot; everything durable lives in the store, sharded by (application,
//! job type) and guarded by advisory locks.

#![warn(missing_docs)]

pub mod adapters;
pub mod apps;
pub mod controller;
pub mod error;
pub mod history;
pub mod lock;
pub mod logs;
pub mod status;
pub mod store;

pub use adapters::ArtifactStore;
pub use adapters::Clock;
pub use adapters::ConfigServer;
pub use adapters::ExternalError;
pub use adapters::JobMetrics;
pub use adapters::ManualClock;
pub use adapters::NoopMetrics;
pub use adapters::PackageDiffer;
pub use adapters::ServiceRegistry;
pub use adapters::SystemClock;
pub use adapters::TesterCloud;
pub use adapters::VersionCompatibility;
pub use adapters::VersionStatus;
pub use apps::Application;
pub use apps::ApplicationStore;
pub use controller::ControllerConfig;
pub use controller::JobController;
pub use controller::Runner;
pub use error::JobError;
pub use error::Result;
pub use lock::LockGuard;
pub use lock::LockService;
pub use lock::LockedStep;
pub use logs::BufferedLogStore;
pub use status::DeploymentStatus;
pub use status::JobStatus;
pub use store::RunStore;
