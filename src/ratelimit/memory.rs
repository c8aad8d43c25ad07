//! In-process order storage.
//!
//! Used by the CLI to evaluate limits against a JSON export of orders, and by
//! tests as a stand-in for the shop's database.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backend::{OrderId, OrderQuery, OrderStatus, OrderStore, OrderTypeRegistry};
use crate::error::{OrderGuardError, Result};

/// Order type used when none is given.
pub const DEFAULT_ORDER_TYPE: &str = "shop_order";

fn default_order_type() -> String {
    DEFAULT_ORDER_TYPE.to_string()
}

/// An order as held by [`InMemoryOrderStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOrder {
    pub id: OrderId,
    pub status: OrderStatus,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredOrder {
    fn matches(&self, query: &OrderQuery) -> bool {
        if !query.statuses.is_empty() && !query.statuses.contains(&self.status) {
            return false;
        }
        if !query.types.is_empty() && !query.types.contains(&self.order_type) {
            return false;
        }
        if let Some(since) = query.created_since {
            if self.created_at < since {
                return false;
            }
        }
        match &query.ip_address {
            Some(ip) => self.ip_address.as_deref() == Some(ip.as_str()),
            None => true,
        }
    }
}

/// Orders kept in memory, queried by linear scan.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<Vec<StoredOrder>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orders(orders: Vec<StoredOrder>) -> Self {
        Self {
            orders: RwLock::new(orders),
        }
    }

    /// Load orders from a JSON array of [`StoredOrder`] records.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading orders");

        let contents = std::fs::read_to_string(path)?;
        let orders: Vec<StoredOrder> = serde_json::from_str(&contents)
            .map_err(|e| OrderGuardError::Store(format!("Failed to parse orders: {}", e)))?;

        debug!(count = orders.len(), "Orders loaded");
        Ok(Self::with_orders(orders))
    }

    /// Record a new order and return its id.
    pub fn insert(
        &self,
        status: OrderStatus,
        order_type: &str,
        ip_address: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> OrderId {
        let mut orders = self.orders.write();
        let id = orders.iter().map(|o| o.id).max().unwrap_or(0) + 1;
        orders.push(StoredOrder {
            id,
            status,
            order_type: order_type.to_string(),
            ip_address: ip_address.map(str::to_string),
            created_at,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }

    /// Distinct order types present in the store.
    pub fn order_types(&self) -> BTreeSet<String> {
        self.orders
            .read()
            .iter()
            .map(|o| o.order_type.clone())
            .collect()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<OrderId>> {
        let orders = self.orders.read();
        let matching = orders.iter().filter(|o| o.matches(query)).map(|o| o.id);

        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}

/// A fixed set of recognized order types.
#[derive(Debug, Clone, Default)]
pub struct StaticOrderTypes {
    types: BTreeSet<String>,
}

impl StaticOrderTypes {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl OrderTypeRegistry for StaticOrderTypes {
    async fn recognized_order_types(&self) -> BTreeSet<String> {
        self.types.clone()
    }
}
