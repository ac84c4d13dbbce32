pub mod config_service;
pub mod json_record_repository;
pub mod local_workspace_fs;
pub mod moodle_roster_gateway;
pub mod paths;
pub mod storage;
pub mod swarm_orchestrator;
pub mod toml_directory_service;

pub use crate::config_service::ConfigService;
pub use crate::json_record_repository::JsonSessionRecordRepository;
pub use crate::local_workspace_fs::LocalWorkspaceFs;
pub use crate::moodle_roster_gateway::MoodleRosterGateway;
pub use crate::paths::CourseHubPaths;
pub use crate::swarm_orchestrator::SwarmOrchestratorClient;
pub use crate::toml_directory_service::TomlDirectoryService;
