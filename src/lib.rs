//! Library crate for svcprobe-rs: a concurrent, multi-protocol service
//! health-probe engine.
pub mod catalog;
pub mod chunked;
pub mod config;
pub mod connection;
pub mod dialog;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod stream;
pub mod telnet;
pub mod tls;
pub mod types;
pub mod verify;

pub use catalog::{ProtocolCatalog, ProtocolDefinition, ProtocolFlags};
pub use config::EngineConfig;
pub use scheduler::{ProbeRun, ResultSink, Scheduler};
pub use types::{Outcome, RunStats, TargetDescriptor, TestResult};
