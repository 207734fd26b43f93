mod attack;
mod breaker;
mod failover;
mod reporter;
mod runner;
mod snapshot;
mod stats;
mod worker;

pub use failover::Executor;
pub use runner::{Engine, RunReport};
