//! In-memory collaborators for booking tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;

use super::collaborators::{Customer, CustomerDirectory, ReplicationNotifier, RestaurantInventory};
use crate::error::{Error, Result};

/// Directory knowing a fixed set of customer ids
pub struct FakeCustomers(pub HashSet<u64>);

#[async_trait]
impl CustomerDirectory for FakeCustomers {
    async fn customer(&self, id: u64) -> Result<Customer> {
        if self.0.contains(&id) {
            Ok(Customer { id, nome: Some(format!("cliente {}", id)), email: None })
        } else {
            Err(Error::CustomerNotFound(id))
        }
    }
}

/// Inventory whose reads and writes yield, so unlocked callers interleave
#[derive(Default)]
pub struct FakeInventory(Mutex<HashMap<u64, u32>>);

impl FakeInventory {
    pub fn with(restaurant: u64, tables: u32) -> Arc<Self> {
        let inventory = Self::default();
        inventory.0.lock().unwrap().insert(restaurant, tables);
        Arc::new(inventory)
    }

    pub fn tables(&self, restaurant: u64) -> u32 {
        self.0.lock().unwrap()[&restaurant]
    }
}

#[async_trait]
impl RestaurantInventory for FakeInventory {
    async fn remaining_tables(&self, restaurant_id: u64) -> Result<u32> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.0
            .lock()
            .unwrap()
            .get(&restaurant_id)
            .copied()
            .ok_or(Error::RestaurantNotFound(restaurant_id))
    }

    async fn set_remaining_tables(&self, restaurant_id: u64, remaining: u32) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.0.lock().unwrap().insert(restaurant_id, remaining);
        Ok(())
    }
}

/// Counts replication notices
#[derive(Default)]
pub struct CountingNotifier(pub AtomicUsize);

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationNotifier for CountingNotifier {
    async fn reservation_changed(&self, _reservation_id: u64) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
