//! Mutual-Exclusion Lock
//!
//! A named, in-process lock with a strict FIFO wait queue. Each grant
//! carries a ticket (used to release it) and the leadership epoch it was
//! issued under; a leadership change clears every holder and fails every
//! waiter with `LeadershipChanged`.
//!
//! The table sits behind a `std::sync::Mutex` that is never held across an
//! await point. Waiters park on a oneshot channel and are handed the lock
//! directly by `release`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::election::LeaderView;
use crate::error::{Error, Result};

/// Resource guarding reservation writes
pub const DEFAULT_RESOURCE: &str = "reserva";

/// An issued lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockGrant {
    pub resource: String,
    pub ticket: u64,
    pub epoch: u64,
}

/// What a call to `release` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock is now free
    Released,
    /// Ownership moved to the waiter holding this ticket
    HandedOver(u64),
    /// Nobody held the lock
    NotHeld,
    /// The named ticket is not the current holder; nothing changed
    TicketMismatch,
}

/// Snapshot of one resource
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub resource: String,
    pub held: bool,
    pub ticket: Option<u64>,
    pub waiters: usize,
    pub epoch: u64,
}

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<Result<LockGrant>>,
}

#[derive(Default)]
struct ResourceState {
    holder: Option<LockGrant>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<String, ResourceState>,
    last_ticket: u64,
    epoch: u64,
}

impl LockTable {
    fn issue_ticket(&mut self) -> u64 {
        self.last_ticket += 1;
        self.last_ticket
    }
}

/// Named FIFO locks for this node
pub struct LockManager {
    table: Mutex<LockTable>,
    /// Upper bound on how long `acquire` waits; `None` waits forever
    acquire_timeout: Option<Duration>,
}

impl LockManager {
    pub fn new(acquire_timeout: Option<Duration>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            acquire_timeout,
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        // Every mutation leaves the table consistent, so a poisoned guard is
        // still usable
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire `resource`, waiting in FIFO order behind current waiters.
    ///
    /// Dropping the returned future gives up the place in the queue; a
    /// grant that raced with the drop is released again.
    pub async fn acquire(&self, resource: &str) -> Result<LockGrant> {
        let (ticket, rx) = {
            let mut table = self.table();
            let ticket = table.issue_ticket();
            let epoch = table.epoch;
            let state = table.resources.entry(resource.to_string()).or_default();

            if state.holder.is_none() {
                let grant = LockGrant {
                    resource: resource.to_string(),
                    ticket,
                    epoch,
                };
                state.holder = Some(grant.clone());
                tracing::debug!("Lock '{}' granted to ticket {}", resource, ticket);
                return Ok(grant);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { ticket, tx });
            tracing::debug!(
                "Ticket {} queued for lock '{}' ({} waiting)",
                ticket,
                resource,
                state.waiters.len()
            );
            (ticket, rx)
        };

        let mut pending = PendingAcquire {
            manager: self,
            resource,
            ticket,
            rx: Some(rx),
        };
        pending.wait().await
    }

    /// Acquire `resource` only if it is free right now
    pub fn try_acquire(&self, resource: &str) -> Result<LockGrant> {
        let mut table = self.table();
        let ticket = table.issue_ticket();
        let epoch = table.epoch;
        let state = table.resources.entry(resource.to_string()).or_default();

        if state.holder.is_some() {
            return Err(Error::LockConflict(resource.to_string()));
        }

        let grant = LockGrant {
            resource: resource.to_string(),
            ticket,
            epoch,
        };
        state.holder = Some(grant.clone());
        tracing::debug!("Lock '{}' granted to ticket {}", resource, ticket);
        Ok(grant)
    }

    /// Acquire `resource` and hold it until the guard is dropped
    pub async fn lock(self: &Arc<Self>, resource: &str) -> Result<LockGuard> {
        let grant = self.acquire(resource).await?;
        Ok(LockGuard {
            manager: Arc::clone(self),
            grant,
        })
    }

    /// Release `resource`. With a ticket, only that holder's grant is
    /// released. Ownership passes to the oldest live waiter.
    pub fn release(&self, resource: &str, ticket: Option<u64>) -> ReleaseOutcome {
        let mut table = self.table();
        let epoch = table.epoch;
        let Some(state) = table.resources.get_mut(resource) else {
            tracing::warn!("Release of unknown lock '{}'", resource);
            return ReleaseOutcome::NotHeld;
        };

        match (&state.holder, ticket) {
            (None, _) => {
                tracing::warn!("Release of lock '{}' which is not held", resource);
                return ReleaseOutcome::NotHeld;
            }
            (Some(holder), Some(ticket)) if holder.ticket != ticket => {
                tracing::warn!(
                    "Ignoring release of lock '{}' by ticket {} (held by {})",
                    resource,
                    ticket,
                    holder.ticket
                );
                return ReleaseOutcome::TicketMismatch;
            }
            _ => {}
        }

        state.holder = None;
        while let Some(waiter) = state.waiters.pop_front() {
            let grant = LockGrant {
                resource: resource.to_string(),
                ticket: waiter.ticket,
                epoch,
            };
            if waiter.tx.send(Ok(grant.clone())).is_ok() {
                tracing::debug!("Lock '{}' handed to ticket {}", resource, waiter.ticket);
                state.holder = Some(grant);
                return ReleaseOutcome::HandedOver(waiter.ticket);
            }
            tracing::debug!("Skipping abandoned waiter {} on '{}'", waiter.ticket, resource);
        }

        tracing::debug!("Lock '{}' released", resource);
        ReleaseOutcome::Released
    }

    /// Drop every holder and fail every waiter when leadership moves to a
    /// newer epoch
    pub fn on_leadership_change(&self, epoch: u64) {
        let mut table = self.table();
        if epoch <= table.epoch {
            return;
        }
        table.epoch = epoch;

        let mut cleared = 0;
        let mut failed = 0;
        for (resource, state) in table.resources.iter_mut() {
            if state.holder.take().is_some() {
                cleared += 1;
            }
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(Err(Error::LeadershipChanged(resource.clone())));
                failed += 1;
            }
        }

        if cleared > 0 || failed > 0 {
            tracing::info!(
                "Leadership epoch {}: cleared {} lock(s), failed {} waiter(s)",
                epoch,
                cleared,
                failed
            );
        }
    }

    /// Apply leadership changes until the sender goes away
    pub async fn follow_leadership(self: Arc<Self>, mut leadership: watch::Receiver<LeaderView>) {
        loop {
            let epoch = leadership.borrow_and_update().epoch;
            self.on_leadership_change(epoch);
            if leadership.changed().await.is_err() {
                break;
            }
        }
    }

    /// Current state of `resource`
    pub fn status(&self, resource: &str) -> LockStatus {
        let table = self.table();
        let state = table.resources.get(resource);
        let holder = state.and_then(|s| s.holder.as_ref());
        LockStatus {
            resource: resource.to_string(),
            held: holder.is_some(),
            ticket: holder.map(|h| h.ticket),
            waiters: state.map_or(0, |s| s.waiters.len()),
            epoch: table.epoch,
        }
    }

    /// Remove a waiter that gave up. If it was already handed the lock,
    /// pass the lock on.
    fn abandon(&self, resource: &str, ticket: u64, mut rx: oneshot::Receiver<Result<LockGrant>>) {
        {
            let mut table = self.table();
            if let Some(state) = table.resources.get_mut(resource) {
                let before = state.waiters.len();
                state.waiters.retain(|w| w.ticket != ticket);
                if state.waiters.len() != before {
                    tracing::debug!("Ticket {} left the queue for '{}'", ticket, resource);
                    return;
                }
            }
        }

        // Grants are sent under the table lock, so one that exists is
        // already in the channel
        if let Ok(Ok(grant)) = rx.try_recv() {
            tracing::debug!("Returning late grant {} on '{}'", grant.ticket, resource);
            self.release(resource, Some(grant.ticket));
        }
    }
}

/// A queued acquire; dropping it leaves the queue
struct PendingAcquire<'a> {
    manager: &'a LockManager,
    resource: &'a str,
    ticket: u64,
    rx: Option<oneshot::Receiver<Result<LockGrant>>>,
}

impl PendingAcquire<'_> {
    async fn wait(&mut self) -> Result<LockGrant> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::Internal("lock wait polled twice".into()));
        };

        let received = match self.manager.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!(
                        "Ticket {} timed out waiting for lock '{}'",
                        self.ticket,
                        self.resource
                    );
                    return Err(Error::LockTimeout(self.resource.to_string()));
                }
            },
            None => rx.await,
        };

        // Settled either way; nothing left to clean up
        self.rx = None;
        received.map_err(|_| Error::ShuttingDown)?
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.manager.abandon(self.resource, self.ticket, rx);
        }
    }
}

/// Holds a lock until dropped
pub struct LockGuard {
    manager: Arc<LockManager>,
    grant: LockGrant,
}

impl LockGuard {
    pub fn grant(&self) -> &LockGrant {
        &self.grant
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager
            .release(&self.grant.resource, Some(self.grant.ticket));
    }
}
