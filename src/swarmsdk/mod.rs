pub mod agent_chat;
pub mod concurrency;
pub mod config;
pub mod context_manager;
pub mod definition;
pub mod delegation;
pub mod hooks;
pub mod llm_client;
pub mod log_stream;
pub mod serialization;
pub mod skill;
pub mod swarm;
pub mod tool;
