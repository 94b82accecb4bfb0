// Strata Kernel
//
// Storage and routing engine for a single-node message broker:
// segmented topic logs, a topic directory, consumer group cursors
// and the request router tying them together.

pub mod config;
pub mod groups;
pub mod log;
mod persist;
pub mod router;
pub mod topic;

pub use config::BrokerConfig;
pub use router::{EngineError, Request, Response, Router};
