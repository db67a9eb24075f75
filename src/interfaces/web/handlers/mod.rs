pub mod agents;
pub mod credentials;
pub mod executions;
pub mod oauth;
pub mod pool;
