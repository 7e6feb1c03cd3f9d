pub mod concurrency;
pub mod config;
pub mod coordinator;
pub mod emitter;
pub mod error;
pub mod expression;
pub mod filter;
pub mod log;
pub mod memory;
pub mod needs;
pub mod queue;
pub mod resolver;
pub mod run;
pub mod scheduler;
pub mod simulate;
pub mod store;
pub mod types;
pub mod workflow;
