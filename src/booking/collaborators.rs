//! Collaborator Clients
//!
//! HTTP clients for the services a booking touches: the customer
//! directory, restaurant inventory and the replicator. The optional name
//! service fills in any base URL left out of the configuration.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ServicesConfig;
use crate::error::{Error, Result};

/// Customer as returned by the customer directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Customer lookup
#[async_trait]
pub trait CustomerDirectory: Send + Sync + 'static {
    /// Fetch a customer; `CustomerNotFound` if it does not exist
    async fn customer(&self, id: u64) -> Result<Customer>;
}

/// Restaurant table counts
#[async_trait]
pub trait RestaurantInventory: Send + Sync + 'static {
    /// Tables still free at a restaurant
    async fn remaining_tables(&self, restaurant_id: u64) -> Result<u32>;

    /// Overwrite the free table count
    async fn set_remaining_tables(&self, restaurant_id: u64, remaining: u32) -> Result<()>;
}

/// Change notifications for the replicator
#[async_trait]
pub trait ReplicationNotifier: Send + Sync + 'static {
    async fn reservation_changed(&self, reservation_id: u64) -> Result<()>;
}

/// The collaborators a booking router works with
#[derive(Clone)]
pub struct Collaborators {
    pub customers: Arc<dyn CustomerDirectory>,
    pub inventory: Arc<dyn RestaurantInventory>,
    pub replication: Option<Arc<dyn ReplicationNotifier>>,
}

impl Collaborators {
    /// HTTP clients for resolved endpoints
    pub fn http(endpoints: &ServiceEndpoints, client: reqwest::Client) -> Self {
        Self {
            customers: Arc::new(HttpCustomerDirectory::new(client.clone(), &endpoints.clientes)),
            inventory: Arc::new(HttpRestaurantInventory::new(
                client.clone(),
                &endpoints.restaurantes,
            )),
            replication: endpoints.replicacao.as_deref().map(|url| {
                Arc::new(HttpReplicationNotifier::new(client, url)) as Arc<dyn ReplicationNotifier>
            }),
        }
    }
}

/// Build the shared client used for collaborator calls
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))
}

fn downstream(service: &str, reason: impl std::fmt::Display) -> Error {
    Error::Downstream {
        service: service.to_string(),
        reason: reason.to_string(),
    }
}

fn base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// `GET {clientes}/clientes/{id}`
pub struct HttpCustomerDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCustomerDirectory {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base(base_url),
        }
    }
}

#[async_trait]
impl CustomerDirectory for HttpCustomerDirectory {
    async fn customer(&self, id: u64) -> Result<Customer> {
        let url = format!("{}/clientes/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| downstream("clientes", e))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(Error::CustomerNotFound(id)),
            status if !status.is_success() => {
                Err(downstream("clientes", format!("status {}", status)))
            }
            _ => response
                .json::<Customer>()
                .await
                .map_err(|e| downstream("clientes", e)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RestaurantTables {
    #[serde(rename = "mesasDisponiveis")]
    mesas_disponiveis: Option<u32>,
}

/// `GET`/`PATCH {restaurantes}/restaurantes/{id}`
pub struct HttpRestaurantInventory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRestaurantInventory {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base(base_url),
        }
    }
}

#[async_trait]
impl RestaurantInventory for HttpRestaurantInventory {
    async fn remaining_tables(&self, restaurant_id: u64) -> Result<u32> {
        let url = format!("{}/restaurantes/{}", self.base_url, restaurant_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| downstream("restaurantes", e))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(Error::RestaurantNotFound(restaurant_id)),
            status if !status.is_success() => {
                Err(downstream("restaurantes", format!("status {}", status)))
            }
            _ => {
                let tables: RestaurantTables = response
                    .json()
                    .await
                    .map_err(|e| downstream("restaurantes", e))?;
                tables.mesas_disponiveis.ok_or_else(|| {
                    downstream(
                        "restaurantes",
                        format!("restaurant {} has no mesasDisponiveis", restaurant_id),
                    )
                })
            }
        }
    }

    async fn set_remaining_tables(&self, restaurant_id: u64, remaining: u32) -> Result<()> {
        let url = format!("{}/restaurantes/{}", self.base_url, restaurant_id);
        let response = self
            .client
            .patch(&url)
            .json(&RestaurantTables {
                mesas_disponiveis: Some(remaining),
            })
            .send()
            .await
            .map_err(|e| downstream("restaurantes", e))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(Error::RestaurantNotFound(restaurant_id)),
            status if !status.is_success() => {
                Err(downstream("restaurantes", format!("status {}", status)))
            }
            _ => Ok(()),
        }
    }
}

/// `POST {replicacao}/replicacao/reserva/{id}`
pub struct HttpReplicationNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReplicationNotifier {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base(base_url),
        }
    }
}

#[async_trait]
impl ReplicationNotifier for HttpReplicationNotifier {
    async fn reservation_changed(&self, reservation_id: u64) -> Result<()> {
        let url = format!("{}/replicacao/reserva/{}", self.base_url, reservation_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| downstream("replicacao", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(downstream("replicacao", format!("status {}", response.status())))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Resolved {
    url: String,
}

/// Name service client: `GET {nomeacao}/resolve/{service}`
pub struct NameService {
    client: reqwest::Client,
    base_url: String,
}

impl NameService {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base(base_url),
        }
    }

    /// Base URL registered for `service`
    pub async fn resolve(&self, service: &str) -> Result<String> {
        let url = format!("{}/resolve/{}", self.base_url, service);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| downstream("nomeacao", e))?;

        if !response.status().is_success() {
            return Err(downstream(
                "nomeacao",
                format!("cannot resolve '{}': status {}", service, response.status()),
            ));
        }

        let resolved: Resolved = response.json().await.map_err(|e| downstream("nomeacao", e))?;
        tracing::info!("Resolved service '{}' to {}", service, resolved.url);
        Ok(base(&resolved.url))
    }
}

/// Collaborator base URLs after name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub clientes: String,
    pub restaurantes: String,
    pub replicacao: Option<String>,
}

impl ServiceEndpoints {
    /// Use configured URLs, asking the name service for the missing ones.
    /// The replicator is optional; the other two are required.
    pub async fn resolve(config: &ServicesConfig, client: &reqwest::Client) -> Result<Self> {
        let names = config
            .name_service_url
            .as_deref()
            .map(|url| NameService::new(client.clone(), url));

        let clientes = Self::pick(&config.clientes_url, names.as_ref(), "clientes").await?;
        let restaurantes =
            Self::pick(&config.restaurantes_url, names.as_ref(), "restaurantes").await?;
        let replicacao = match Self::pick(&config.replicacao_url, names.as_ref(), "replicacao").await
        {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!("Replication notifications disabled: {}", e);
                None
            }
        };

        Ok(Self {
            clientes,
            restaurantes,
            replicacao,
        })
    }

    async fn pick(
        configured: &Option<String>,
        names: Option<&NameService>,
        service: &str,
    ) -> Result<String> {
        if let Some(url) = configured.as_deref().filter(|u| !u.is_empty()) {
            return Ok(base(url));
        }
        match names {
            Some(names) => names.resolve(service).await,
            None => Err(Error::Config(format!(
                "no URL configured for service '{}' and no name service",
                service
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restaurant_wire_name() {
        let body = serde_json::to_value(RestaurantTables {
            mesas_disponiveis: Some(4),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"mesasDisponiveis": 4}));

        let parsed: RestaurantTables =
            serde_json::from_str(r#"{"id": 1, "nome": "Cantina", "mesasDisponiveis": 2}"#).unwrap();
        assert_eq!(parsed.mesas_disponiveis, Some(2));
    }

    #[test]
    fn test_customer_tolerates_extra_fields() {
        let customer: Customer =
            serde_json::from_str(r#"{"id": 7, "nome": "Ana", "email": "ana@x", "cpf": "1"}"#)
                .unwrap();
        assert_eq!(customer.id, 7);
        assert_eq!(customer.nome.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_configured_urls_need_no_name_service() {
        let config = ServicesConfig {
            clientes_url: Some("http://clientes:3000/".into()),
            restaurantes_url: Some("http://restaurantes:3002".into()),
            replicacao_url: None,
            name_service_url: None,
        };
        let client = http_client(Duration::from_millis(200)).unwrap();

        let endpoints = ServiceEndpoints::resolve(&config, &client).await.unwrap();
        assert_eq!(endpoints.clientes, "http://clientes:3000");
        assert_eq!(endpoints.restaurantes, "http://restaurantes:3002");
        assert!(endpoints.replicacao.is_none());
    }

    #[tokio::test]
    async fn test_missing_required_url() {
        let config = ServicesConfig {
            clientes_url: None,
            restaurantes_url: Some("http://restaurantes:3002".into()),
            ..Default::default()
        };
        let client = http_client(Duration::from_millis(200)).unwrap();

        let err = ServiceEndpoints::resolve(&config, &client).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_customer_service_is_downstream_error() {
        let client = http_client(Duration::from_millis(200)).unwrap();
        let directory = HttpCustomerDirectory::new(client, "http://127.0.0.1:9");

        let err = directory.customer(1).await.unwrap_err();
        assert!(matches!(err, Error::Downstream { .. }));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
