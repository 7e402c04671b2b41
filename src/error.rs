//! Reservas Error Types

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid peer entry '{0}': expected id|url")]
    InvalidPeer(String),

    // Election errors
    #[error("No leader available")]
    NoLeader,

    #[error("Request already forwarded once and this node is not the leader")]
    ForwardLoop,

    // Lock errors
    #[error("Lock '{0}' is held")]
    LockConflict(String),

    #[error("Timed out waiting for lock '{0}'")]
    LockTimeout(String),

    #[error("Leadership changed while waiting for lock '{0}'")]
    LeadershipChanged(String),

    // Booking errors
    #[error("Customer {0} not found")]
    CustomerNotFound(u64),

    #[error("Restaurant {0} not found")]
    RestaurantNotFound(u64),

    #[error("No tables left at restaurant {0}")]
    NoTablesAvailable(u64),

    #[error("Reservation {0} not found")]
    ReservationNotFound(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Downstream service {service} failed: {reason}")]
    Downstream { service: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer unreachable at {address}: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Failed to forward to leader: {0}")]
    Forward(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoLeader
                | Error::LockConflict(_)
                | Error::LockTimeout(_)
                | Error::LeadershipChanged(_)
                | Error::ConnectionTimeout(_)
                | Error::PeerUnreachable { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error means a peer should be treated as down
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable { .. } | Error::ConnectionTimeout(_) | Error::Network(_)
        )
    }

    /// HTTP status used when this error reaches an API caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NoLeader | Error::LeadershipChanged(_) | Error::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::ForwardLoop => StatusCode::LOOP_DETECTED,
            Error::LockConflict(_) | Error::NoTablesAvailable(_) => StatusCode::CONFLICT,
            Error::LockTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::ReservationNotFound(_) => StatusCode::NOT_FOUND,
            Error::CustomerNotFound(_)
            | Error::RestaurantNotFound(_)
            | Error::InvalidRequest(_)
            | Error::Downstream { .. } => StatusCode::BAD_REQUEST,
            Error::Forward(_) | Error::PeerUnreachable { .. } | Error::ConnectionTimeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) | Error::InvalidPeer(_) => "CONFIG_ERROR",
            Error::NoLeader => "NO_LEADER",
            Error::ForwardLoop => "FORWARD_LOOP",
            Error::LockConflict(_) => "LOCK_CONFLICT",
            Error::LockTimeout(_) => "LOCK_TIMEOUT",
            Error::LeadershipChanged(_) => "LEADERSHIP_CHANGED",
            Error::CustomerNotFound(_) => "INVALID_CUSTOMER",
            Error::RestaurantNotFound(_) => "INVALID_RESTAURANT",
            Error::NoTablesAvailable(_) => "NO_TABLES",
            Error::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Downstream { .. } => "DOWNSTREAM_ERROR",
            Error::Forward(_) | Error::PeerUnreachable { .. } | Error::ConnectionTimeout(_) => {
                "FORWARD_ERROR"
            }
            Error::ShuttingDown => "SHUTTING_DOWN",
            _ => "INTERNAL_ERROR",
        }
    }
}
