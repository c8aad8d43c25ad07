//! Order storage traits the limiter counts against.
//!
//! The host shop implements these over its own order tables; the
//! [`memory`](super::memory) module provides in-process versions.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of a stored order.
pub type OrderId = u64;

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
}

impl OrderStatus {
    /// Statuses that count against a client's allowance.
    pub const COUNTED: [OrderStatus; 4] = [
        OrderStatus::Completed,
        OrderStatus::OnHold,
        OrderStatus::Processing,
        OrderStatus::Pending,
    ];
}

/// Filter passed to [`OrderStore::find_orders`].
///
/// Empty sets and `None` fields do not constrain the query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderQuery {
    pub statuses: BTreeSet<OrderStatus>,
    /// Only orders created at or after this instant
    pub created_since: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub types: BTreeSet<String>,
    /// Maximum number of ids to return
    pub limit: Option<usize>,
}

impl OrderQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses<I: IntoIterator<Item = OrderStatus>>(mut self, statuses: I) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Read access to the shop's orders.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Ids of the orders matching `query`.
    async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<OrderId>>;
}

/// The order-like record types the host recognizes.
#[async_trait]
pub trait OrderTypeRegistry: Send + Sync {
    /// Types whose records count as orders. May be empty while the host is
    /// still initializing.
    async fn recognized_order_types(&self) -> BTreeSet<String>;
}
