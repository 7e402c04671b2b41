//! Coordinator-Aware Request Router
//!
//! Booking requests are served by the leader only. Other nodes forward the
//! request once, marked with a hop header; a marked request that reaches a
//! non-leader is refused so a stale view cannot bounce it around.
//!
//! On the leader, a booking or cancellation takes the lock only when the
//! restaurant is at or below the low-capacity threshold. Above it, the
//! read-check-write runs unlocked and concurrent bookings may interleave.

use std::sync::Arc;
use serde::Deserialize;
use tracing::Instrument;
use uuid::Uuid;

use super::collaborators::Collaborators;
use super::ledger::{NewReservation, Reservation, ReservationLedger};
use crate::cluster::NodeSpec;
use crate::election::ElectionEngine;
use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockManager};

/// Hop marker set on forwarded requests
pub const FORWARDED_HEADER: &str = "x-reservas-forwarded";

/// `POST /reservas` body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub cliente_id: Option<u64>,
    #[serde(alias = "restaurante")]
    pub restaurante_id: Option<u64>,
    pub data: Option<String>,
    pub horario: Option<String>,
    pub numero_pessoas: Option<u32>,
}

impl BookingRequest {
    /// Check required fields
    pub fn validate(self) -> Result<NewReservation> {
        let (Some(cliente_id), Some(restaurante_id), Some(data)) =
            (self.cliente_id, self.restaurante_id, self.data)
        else {
            return Err(Error::InvalidRequest(
                "clienteId, restauranteId and data are required".into(),
            ));
        };
        if data.trim().is_empty() {
            return Err(Error::InvalidRequest("data cannot be empty".into()));
        }
        let numero_pessoas = self.numero_pessoas.unwrap_or(1);
        if numero_pessoas == 0 {
            return Err(Error::InvalidRequest("numeroPessoas must be at least 1".into()));
        }

        Ok(NewReservation {
            cliente_id,
            restaurante_id,
            data,
            horario: self.horario,
            numero_pessoas,
        })
    }
}

/// Where a request should be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// This node is the leader
    Local,
    /// Relay to the leader
    Forward(NodeSpec),
}

/// Leader reply relayed to the original caller
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// When the lock is taken
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Lock resource guarding bookings
    pub resource: String,
    /// Lock when free tables are at or below this
    pub low_capacity_threshold: u32,
}

/// Routes and serves booking requests
pub struct BookingRouter {
    engine: Arc<ElectionEngine>,
    locks: Arc<LockManager>,
    ledger: ReservationLedger,
    collaborators: Collaborators,
    policy: BookingPolicy,
    /// Client used to relay requests to the leader
    client: reqwest::Client,
}

impl BookingRouter {
    pub fn new(
        engine: Arc<ElectionEngine>,
        locks: Arc<LockManager>,
        collaborators: Collaborators,
        policy: BookingPolicy,
        client: reqwest::Client,
    ) -> Self {
        Self {
            engine,
            locks,
            ledger: ReservationLedger::new(),
            collaborators,
            policy,
            client,
        }
    }

    /// Decide where a request runs. `already_forwarded` is whether the
    /// request carries the hop marker.
    pub fn route(&self, already_forwarded: bool) -> Result<Route> {
        match self.engine.current_leader() {
            None => Err(Error::NoLeader),
            Some(leader) if leader.id == self.engine.node_id() => Ok(Route::Local),
            Some(leader) if already_forwarded => {
                tracing::warn!(
                    "Refusing forwarded request: node {} is not leader (leader is {})",
                    self.engine.node_id(),
                    leader.id
                );
                Err(Error::ForwardLoop)
            }
            Some(leader) => Ok(Route::Forward(leader)),
        }
    }

    /// Relay a request to the leader once and return its reply verbatim
    pub async fn forward(
        &self,
        leader: &NodeSpec,
        method: &str,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ForwardedResponse> {
        let url = format!("{}{}", leader.url, path_and_query);
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| Error::Forward(format!("invalid method {}: {}", method, e)))?;

        tracing::debug!("Forwarding {} {} to leader {}", method, path_and_query, leader.id);

        let mut request = self
            .client
            .request(method, &url)
            .header(FORWARDED_HEADER, self.engine.node_id().to_string());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!("Failed to forward to leader {}: {}", leader.id, e);
            Error::Forward(format!("failed to contact leader at {}: {}", leader.url, e))
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Forward(format!("failed to read leader response: {}", e)))?;

        Ok(ForwardedResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }

    /// Book a table (leader only)
    pub async fn book(&self, request: BookingRequest) -> Result<Reservation> {
        let span = tracing::info_span!("booking", request_id = %Uuid::new_v4());
        async move {
            let new = request.validate()?;
            let restaurant = new.restaurante_id;

            let _guard = self.guard_if_low(restaurant).await?;

            let customer = self.collaborators.customers.customer(new.cliente_id).await?;
            let remaining = self.collaborators.inventory.remaining_tables(restaurant).await?;
            if remaining == 0 {
                tracing::info!("Restaurant {} has no tables left", restaurant);
                return Err(Error::NoTablesAvailable(restaurant));
            }
            self.collaborators
                .inventory
                .set_remaining_tables(restaurant, remaining - 1)
                .await?;

            let reservation = self.ledger.record(customer, new).await;
            tracing::info!(
                "Reservation {} booked at restaurant {} ({} tables left)",
                reservation.id,
                restaurant,
                remaining - 1
            );
            self.notify(reservation.id);
            Ok(reservation)
        }
        .instrument(span)
        .await
    }

    /// Cancel a reservation and give its table back (leader only)
    pub async fn cancel(&self, id: u64) -> Result<Reservation> {
        let span = tracing::info_span!("cancellation", request_id = %Uuid::new_v4(), reservation = id);
        async move {
            let existing = self
                .ledger
                .get(id)
                .await
                .ok_or(Error::ReservationNotFound(id))?;
            let restaurant = existing.restaurante_id;

            let _guard = self.guard_if_low(restaurant).await?;

            let removed = self
                .ledger
                .remove(id)
                .await
                .ok_or(Error::ReservationNotFound(id))?;
            let remaining = self.collaborators.inventory.remaining_tables(restaurant).await?;
            self.collaborators
                .inventory
                .set_remaining_tables(restaurant, remaining.saturating_add(1))
                .await?;

            tracing::info!("Reservation {} cancelled at restaurant {}", id, restaurant);
            self.notify(id);
            Ok(removed)
        }
        .instrument(span)
        .await
    }

    /// Reservations held by this node
    pub async fn list(&self) -> Vec<Reservation> {
        self.ledger.list().await
    }

    /// Take the lock when the restaurant is running low
    async fn guard_if_low(&self, restaurant: u64) -> Result<Option<LockGuard>> {
        let remaining = self.collaborators.inventory.remaining_tables(restaurant).await?;
        if remaining > self.policy.low_capacity_threshold {
            return Ok(None);
        }

        tracing::debug!(
            "Restaurant {} is low on tables ({}), locking '{}'",
            restaurant,
            remaining,
            self.policy.resource
        );
        let guard = self.locks.lock(&self.policy.resource).await?;
        Ok(Some(guard))
    }

    /// Fire-and-forget replication notice
    fn notify(&self, reservation_id: u64) {
        let Some(replication) = self.collaborators.replication.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = replication.reservation_changed(reservation_id).await {
                tracing::warn!("Replication notice for reservation {} failed: {}", reservation_id, e);
            }
        });
    }
}
