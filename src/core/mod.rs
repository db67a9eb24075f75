pub mod agent;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod oauth;
pub mod pool;
pub mod runtime;
pub mod supervisor;
pub mod terminal;
pub mod tracker;
pub mod vault;
