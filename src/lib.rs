pub mod collaborators;
pub mod config;
pub mod dest_resolver;
pub mod error;
pub mod feasibility;
pub mod finalize;
pub mod logger;
pub mod map_inference;
pub mod memory_migration;
pub mod metadata_transfer;
pub mod mirror;
pub mod model;
pub mod orchestrator;
pub mod throttle;
pub mod vgpu_mapper;

pub use config::EngineConfig;
pub use error::MigrateError;
pub use orchestrator::Orchestrator;

pub type Result<T> = std::result::Result<T, MigrateError>;
