pub mod container_models;
pub mod heartbeat_models;
pub mod session_models;
