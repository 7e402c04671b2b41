//! Reservas - Coordinated Reservation Service
//!
//! Leader election and critical-section coordination for a set of
//! redundant reservation service instances.
//!
//! # Architecture
//!
//! Every node runs a Bully election over a fixed membership list and
//! probes the elected coordinator with heartbeats. Booking requests are
//! served by the coordinator only; other nodes forward them once. When a
//! restaurant is running low on tables the coordinator serializes the
//! read-check-write through a FIFO lock whose grants are tied to the
//! leadership epoch.
//!
//! # Features
//!
//! - Bully election with round numbers and stale-announcement rejection
//! - Heartbeat-driven failover
//! - FIFO mutual-exclusion lock with timeouts and RAII guards
//! - Leader-routed booking with hop-marked forwarding
//! - HTTP API for peers, locking and bookings

pub mod api;
pub mod booking;
pub mod cluster;
pub mod config;
pub mod election;
pub mod error;
pub mod lock;
pub mod transport;

pub use config::CoordinatorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::booking::{BookingRouter, Reservation};
    pub use crate::cluster::{ClusterMembership, NodeSpec};
    pub use crate::config::CoordinatorConfig;
    pub use crate::election::{ElectionEngine, ElectionState, LeaderView};
    pub use crate::error::{Error, Result};
    pub use crate::lock::{LockGuard, LockManager};
    pub use crate::transport::{HttpTransport, PeerTransport};
}
