pub mod audit;
pub mod auth;
pub mod chunker;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod fetch;
pub mod lifecycle;
pub mod llm;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod summarizer;
pub mod terminal;
pub mod vault;
pub mod worker;
