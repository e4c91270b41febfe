//! Session orchestration modules.
//!
//! Covers crash-signal collection, checkpoint triggering and creation,
//! resume detection, and crash recovery.

pub mod checkpoint_manager;
pub mod crash_recovery;
pub mod resume_detector;
pub mod signal_collector;
