//! Worker core: leases jobs from the queue server, renders them, runs the
//! right tool executor and reports the outcome as events.

pub mod config;
pub mod executors;
pub mod normalize;
pub mod retry;
pub mod save;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::Worker;
