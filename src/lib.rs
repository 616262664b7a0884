pub mod bridge;
pub mod cache;
pub mod consts;
pub mod engine;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod parser;
pub mod processor;
pub mod prompts;
pub mod router;
pub mod runtime;
pub mod status;
pub mod store;
