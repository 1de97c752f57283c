pub mod client;
pub mod config;
pub mod config_validation;
pub mod driver;
pub mod errors;
pub mod fd_sampler;
pub mod fixture;
pub mod metrics;
pub mod orchestrator;
pub mod report;
pub mod result;
pub mod stats;
pub mod utils;
pub mod yaml_config;
