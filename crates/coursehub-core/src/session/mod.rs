//! Session lifecycle: state machine, orchestrator contract and readiness
//! polling.

pub mod backoff;
pub mod controller;
pub mod launch;
pub mod model;
pub mod orchestrator;
pub mod repository;

pub use backoff::ReadinessBackoff;
pub use controller::SessionLifecycleController;
pub use launch::build_launch_spec;
pub use model::{SessionRecord, SessionState, StateChange, service_name_for};
pub use orchestrator::{
    ClusterOrchestratorClient, LaunchSpec, OrchestratorError, ResourceLimits, TaskFilter,
    TaskInfo, TaskState, nano_cpus,
};
pub use repository::SessionRecordRepository;
