//! Pure data model for larch deployment jobs.
//!
//! Everything in this crate is plain data: identifiers, platform and
//! application versions, job steps and their prerequisite DAG, the [`Run`]
//! state machine, log entry types and application packages. There is no I/O
//! and no async here; the `larch-deploy` crate layers persistence, locking
//! and the controller on top.

#![warn(missing_docs)]

pub mod id;
pub mod log;
pub mod package;
pub mod run;
pub mod step;
pub mod version;

pub use id::ApplicationId;
pub use id::ApplicationName;
pub use id::DeploymentId;
pub use id::Environment;
pub use id::InstanceName;
pub use id::JobId;
pub use id::JobType;
pub use id::RunId;
pub use id::TenantAndApplicationId;
pub use id::TenantName;
pub use id::TesterId;
pub use id::ZoneId;
pub use log::LogEntry;
pub use log::LogType;
pub use log::RunLog;
pub use log::TestReport;
pub use package::ApplicationPackage;
pub use package::SourceRevision;
pub use run::Run;
pub use run::RunError;
pub use run::RunStatus;
pub use step::JobProfile;
pub use step::Step;
pub use step::StepInfo;
pub use step::StepStatus;
pub use version::ApplicationVersion;
pub use version::Version;
pub use version::Versions;
