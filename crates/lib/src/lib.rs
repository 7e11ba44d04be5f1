//! Lamplight core library: session state, streaming coordination, persistence, the Ollama
//! client and the gateway, shared by the CLI.

pub mod chat;
pub mod command;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod params;
pub mod persist;
pub mod session;
pub mod surface;
