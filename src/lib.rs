pub mod config;
pub mod dashboard;
pub mod election;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod store;
