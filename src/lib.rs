//! Meeting recorder orchestrator.
//!
//! Pops "join this meeting and record it" jobs from a queue, runs each one in
//! a recorder container with retries, tracks progress from the container's
//! log output, and writes the recording's status back to the store. A second
//! loop handles cancellation requests.

pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod recording;
pub mod session;
pub mod status;
pub mod store;
pub mod watcher;

#[cfg(test)]
mod testing;
