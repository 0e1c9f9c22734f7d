pub mod agent;
pub mod chat;
pub mod config;
pub mod http_client;
pub mod llm_client;
pub mod runtime;
pub mod session;
pub mod tools;

#[cfg(test)]
mod testing;
