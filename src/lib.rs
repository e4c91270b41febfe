#![forbid(unsafe_code)]

//! Coordination and crash-recovery core for fleets of long-running agent
//! chat sessions.
//!
//! Independent processes share a [`store::SharedStore`] for distributed
//! locks and worker liveness. Each session feeds its activity into a
//! [`orchestrator::signal_collector::SignalCollector`]; the
//! [`orchestrator::checkpoint_manager::CheckpointManager`] turns the derived
//! risk into numbered checkpoints, and the
//! [`orchestrator::resume_detector::ResumeDetector`] decides on the next
//! start whether to resume.

pub mod config;
pub mod coordination;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod store;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
