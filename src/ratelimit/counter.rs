//! Order counting against the order store.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, trace};

use super::backend::{OrderQuery, OrderStatus, OrderStore, OrderTypeRegistry};
use super::interval::Window;
use crate::error::{OrderGuardError, Result};

/// Minimum number of orders scanned when counting qualifying orders.
pub const QUALIFYING_SCAN_FLOOR: i64 = 1000;

/// Hook consulted before the qualifying-orders query. Returning `Some`
/// replaces the query result.
pub type PreCountHook = Arc<dyn Fn(&Window) -> Option<u64> + Send + Sync>;

/// Counts orders placed within a time range.
pub struct OrderCounter {
    store: Arc<dyn OrderStore>,
    registry: Arc<dyn OrderTypeRegistry>,
    pre_count: Option<PreCountHook>,
}

impl OrderCounter {
    pub fn new(store: Arc<dyn OrderStore>, registry: Arc<dyn OrderTypeRegistry>) -> Self {
        Self {
            store,
            registry,
            pre_count: None,
        }
    }

    /// Install a hook that can supply the qualifying-orders count.
    pub fn with_pre_count_hook(mut self, hook: PreCountHook) -> Self {
        self.pre_count = Some(hook);
        self
    }

    /// Count the orders placed from `ip_address` at or after `since` that
    /// still count against the allowance.
    pub async fn count_orders(&self, ip_address: &str, since: DateTime<FixedOffset>) -> Result<u64> {
        let query = OrderQuery::new()
            .with_statuses(OrderStatus::COUNTED)
            .created_since(since.with_timezone(&Utc))
            .with_ip_address(ip_address);

        let count = self.store.find_orders(&query).await?.len() as u64;

        trace!(
            ip = %ip_address,
            since = %since,
            count = count,
            "Counted orders for client"
        );

        Ok(count)
    }

    /// Count orders of every recognized order type created since the window
    /// started, regardless of client.
    ///
    /// At most `max(limit, 1000)` orders are considered, so busy stores may be
    /// undercounted. Fails with [`OrderGuardError::EmptyOrderTypes`] when the
    /// host does not recognize any order types yet.
    pub async fn count_qualifying_orders(&self, window: &Window, limit: i64) -> Result<u64> {
        if let Some(hook) = &self.pre_count {
            if let Some(count) = hook(window) {
                debug!(count = count, "Qualifying order count supplied by hook");
                return Ok(count);
            }
        }

        let types = self.registry.recognized_order_types().await;
        if types.is_empty() {
            return Err(OrderGuardError::EmptyOrderTypes);
        }

        let scan_cap = usize::try_from(limit.max(QUALIFYING_SCAN_FLOOR)).unwrap_or(usize::MAX);
        let query = OrderQuery::new()
            .with_types(types)
            .created_since(window.start.with_timezone(&Utc))
            .with_limit(scan_cap);

        let count = self.store.find_orders(&query).await?.len() as u64;

        debug!(
            window_start = %window.start,
            scan_cap = scan_cap,
            count = count,
            "Counted qualifying orders"
        );

        Ok(count)
    }
}

impl fmt::Debug for OrderCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderCounter")
            .field("pre_count", &self.pre_count.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::memory::{InMemoryOrderStore, StaticOrderTypes};
    use async_trait::async_trait;
    use chrono::TimeDelta;

    fn at(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    fn counter_over(store: Arc<InMemoryOrderStore>) -> OrderCounter {
        OrderCounter::new(store, Arc::new(StaticOrderTypes::new(["shop_order"])))
    }

    #[tokio::test]
    async fn test_count_orders_filters_by_ip_status_and_time() {
        let store = Arc::new(InMemoryOrderStore::new());
        let utc = |s: &str| at(s).with_timezone(&Utc);
        store.insert(OrderStatus::Completed, "shop_order", Some("203.0.113.7"), utc("2026-03-11T09:00:00Z"));
        store.insert(OrderStatus::OnHold, "shop_order", Some("203.0.113.7"), utc("2026-03-11T10:00:00Z"));
        store.insert(OrderStatus::Failed, "shop_order", Some("203.0.113.7"), utc("2026-03-11T10:30:00Z"));
        store.insert(OrderStatus::Pending, "shop_order", Some("198.51.100.2"), utc("2026-03-11T10:30:00Z"));
        store.insert(OrderStatus::Pending, "shop_order", Some("203.0.113.7"), utc("2026-03-10T23:59:59Z"));

        let counter = counter_over(store);
        let count = counter
            .count_orders("203.0.113.7", at("2026-03-11T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_qualifying_orders_span_all_clients() {
        let store = Arc::new(InMemoryOrderStore::new());
        let window = Window {
            start: at("2026-03-11T00:00:00Z"),
            end: at("2026-03-12T00:00:00Z"),
        };
        let utc = window.start.with_timezone(&Utc);
        store.insert(OrderStatus::Completed, "shop_order", Some("203.0.113.7"), utc);
        store.insert(OrderStatus::Cancelled, "shop_order", Some("198.51.100.2"), utc + TimeDelta::hours(1));
        store.insert(OrderStatus::Completed, "refund", None, utc + TimeDelta::hours(2));
        store.insert(OrderStatus::Completed, "shop_order", None, utc - TimeDelta::hours(2));

        let counter = counter_over(store);
        assert_eq!(counter.count_qualifying_orders(&window, 5).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_qualifying_orders_scan_is_capped() {
        let store = Arc::new(InMemoryOrderStore::new());
        let window = Window {
            start: at("2026-03-11T00:00:00Z"),
            end: at("2026-03-12T00:00:00Z"),
        };
        for i in 0..1005 {
            store.insert(
                OrderStatus::Completed,
                "shop_order",
                None,
                window.start.with_timezone(&Utc) + TimeDelta::seconds(i),
            );
        }

        let counter = counter_over(store);
        assert_eq!(counter.count_qualifying_orders(&window, 3).await.unwrap(), 1000);
        assert_eq!(counter.count_qualifying_orders(&window, -1).await.unwrap(), 1000);
        assert_eq!(counter.count_qualifying_orders(&window, 1002).await.unwrap(), 1002);
    }

    #[tokio::test]
    async fn test_empty_order_types_is_an_error() {
        let counter = OrderCounter::new(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(StaticOrderTypes::default()),
        );
        let window = Window::at(at("2026-03-11T00:00:00Z"));

        let result = counter.count_qualifying_orders(&window, 5).await;
        assert!(matches!(result, Err(OrderGuardError::EmptyOrderTypes)));
    }

    #[tokio::test]
    async fn test_pre_count_hook_short_circuits() {
        let counter = OrderCounter::new(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(StaticOrderTypes::default()),
        )
        .with_pre_count_hook(Arc::new(|_window: &Window| Some(42)));
        let window = Window::at(at("2026-03-11T00:00:00Z"));

        assert_eq!(counter.count_qualifying_orders(&window, 5).await.unwrap(), 42);
    }

    struct BrokenStore;

    #[async_trait]
    impl OrderStore for BrokenStore {
        async fn find_orders(&self, _query: &OrderQuery) -> Result<Vec<u64>> {
            Err(OrderGuardError::Store("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let counter = OrderCounter::new(
            Arc::new(BrokenStore),
            Arc::new(StaticOrderTypes::new(["shop_order"])),
        );
        let result = counter.count_orders("203.0.113.7", at("2026-03-11T00:00:00Z")).await;
        assert!(matches!(result, Err(OrderGuardError::Store(_))));
    }
}
