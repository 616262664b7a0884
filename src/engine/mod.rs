pub mod manager;

pub use manager::{EngineManager, ManagerConfig, classify_phase};
