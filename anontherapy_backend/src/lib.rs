pub mod blob_store;
pub mod config;
pub mod database;
pub mod funding;
pub mod llm_client;
pub mod personas;
pub mod server;
pub mod transcript;
