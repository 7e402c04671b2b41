//! Reservation Booking
//!
//! The leader-only booking path: routing to the leader, the
//! capacity-aware critical section and the collaborator services it calls.

pub mod collaborators;
pub mod ledger;
pub mod router;
#[cfg(test)]
pub mod testing;

pub use collaborators::{
    Collaborators, Customer, CustomerDirectory, ReplicationNotifier, RestaurantInventory,
    ServiceEndpoints,
};
pub use ledger::{Reservation, ReservationLedger};
pub use router::{BookingPolicy, BookingRequest, BookingRouter, ForwardedResponse, Route, FORWARDED_HEADER};
