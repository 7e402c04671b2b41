//! Reservation Ledger
//!
//! In-memory record of the reservations accepted by this node while it
//! was leader. Not persisted; the replicator keeps the durable copy.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::collaborators::Customer;

/// An accepted reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: u64,
    pub cliente_id: u64,
    pub cliente: Customer,
    pub restaurante_id: u64,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horario: Option<String>,
    pub numero_pessoas: u32,
    pub criado_em: DateTime<Utc>,
}

/// Fields of a reservation before it is assigned an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub cliente_id: u64,
    pub restaurante_id: u64,
    pub data: String,
    pub horario: Option<String>,
    pub numero_pessoas: u32,
}

struct LedgerInner {
    reservations: BTreeMap<u64, Reservation>,
    next_id: u64,
}

/// Reservation store
pub struct ReservationLedger {
    inner: RwLock<LedgerInner>,
}

impl Default for ReservationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                reservations: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Store a reservation under the next id
    pub async fn record(&self, customer: Customer, new: NewReservation) -> Reservation {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;

        let reservation = Reservation {
            id,
            cliente_id: new.cliente_id,
            cliente: customer,
            restaurante_id: new.restaurante_id,
            data: new.data,
            horario: new.horario,
            numero_pessoas: new.numero_pessoas,
            criado_em: Utc::now(),
        };
        inner.reservations.insert(id, reservation.clone());
        reservation
    }

    pub async fn get(&self, id: u64) -> Option<Reservation> {
        self.inner.read().await.reservations.get(&id).cloned()
    }

    pub async fn remove(&self, id: u64) -> Option<Reservation> {
        self.inner.write().await.reservations.remove(&id)
    }

    /// All reservations, oldest first
    pub async fn list(&self) -> Vec<Reservation> {
        self.inner.read().await.reservations.values().cloned().collect()
    }
}
