//! Leader Election
//!
//! Bully election over a fixed membership, plus the heartbeat prober that
//! triggers a new election when the coordinator stops answering.

pub mod protocol;
mod engine;
mod prober;

pub use engine::{ElectionConfig, ElectionEngine, ElectionOutcome, LeaderView};
pub use prober::{HeartbeatProber, ProbeOutcome};
pub use protocol::{ElectionState, StatusReply};
