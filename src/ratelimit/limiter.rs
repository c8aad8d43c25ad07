//! Core order limiter.
//!
//! Decisions are recomputed from settings, the clock and the order store on
//! every call. Nothing records that a client is blocked; a client is blocked
//! exactly while its counted orders in the current window reach the limit.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Weekday};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::backend::{OrderStore, OrderTypeRegistry};
use super::cache::CountCache;
use super::clock::{Clock, SystemClock};
use super::counter::{OrderCounter, PreCountHook};
use super::interval::{IntervalSpec, Window, WindowHook};
use super::message::{MessageKind, MessageTemplater, PlaceholderHook, Placeholders};
use super::settings::{
    settings_fields, CountingMode, FieldKind, IntervalOptionsHook, LimiterSettings, SettingsDescription, UNLIMITED,
};
use crate::config::StoreLocale;
use crate::error::{OrderGuardError, Result};
use crate::identity::ClientIp;

/// Messages for a client whose orders are being refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedNotice {
    /// Reason given when checkout is aborted
    pub checkout_error: String,
    /// Notice shown on shop pages
    pub customer_notice: String,
    /// Text shown in place of the order button
    pub order_button: String,
}

/// Outcome of evaluating a checkout attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The order may proceed. `remaining` is [`UNLIMITED`] when no cap applies.
    Allowed { remaining: i64 },
    /// The client has used up its allowance for this window.
    Blocked(BlockedNotice),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn remaining(&self) -> i64 {
        match self {
            Decision::Allowed { remaining } => *remaining,
            Decision::Blocked(_) => 0,
        }
    }

    pub fn message_if_blocked(&self) -> Option<&str> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Blocked(notice) => Some(&notice.checkout_error),
        }
    }

    /// Turn a blocked decision into an error for checkout flows that abort
    /// by propagating one.
    pub fn into_checkout_result(self) -> Result<i64> {
        match self {
            Decision::Allowed { remaining } => Ok(remaining),
            Decision::Blocked(notice) => Err(OrderGuardError::OrdersNotAccepted(notice.checkout_error)),
        }
    }
}

/// Settings and time captured once per decision pass.
struct Pass {
    now: DateTime<FixedOffset>,
    settings: LimiterSettings,
    window: Window,
}

impl Pass {
    fn limit(&self) -> i64 {
        self.settings.effective_limit()
    }

    /// Start of the range counted against a client.
    fn counted_since(&self) -> DateTime<FixedOffset> {
        match self.settings.counting {
            CountingMode::Calendar => self.window.start,
            CountingMode::Rolling => self.now - self.settings.interval.lookback(),
        }
    }
}

/// Builder for [`OrderLimiter`].
pub struct OrderLimiterBuilder {
    settings: LimiterSettings,
    locale: StoreLocale,
    store: Arc<dyn OrderStore>,
    registry: Arc<dyn OrderTypeRegistry>,
    clock: Arc<dyn Clock>,
    placeholder_hook: Option<PlaceholderHook>,
    pre_count_hook: Option<PreCountHook>,
    window_hook: Option<WindowHook>,
    interval_options_hook: Option<IntervalOptionsHook>,
}

impl OrderLimiterBuilder {
    pub fn settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn locale(mut self, locale: StoreLocale) -> Self {
        self.locale = locale;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn placeholder_hook(mut self, hook: PlaceholderHook) -> Self {
        self.placeholder_hook = Some(hook);
        self
    }

    pub fn pre_count_hook(mut self, hook: PreCountHook) -> Self {
        self.pre_count_hook = Some(hook);
        self
    }

    /// Adjust window boundaries, for stores whose periods do not follow the
    /// calendar.
    pub fn window_hook(mut self, hook: WindowHook) -> Self {
        self.window_hook = Some(hook);
        self
    }

    pub fn interval_options_hook(mut self, hook: IntervalOptionsHook) -> Self {
        self.interval_options_hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<OrderLimiter> {
        self.locale.validate()?;
        let offset = self.locale.offset()?;
        let week_starts_on = self.locale.week_start()?;

        let mut counter = OrderCounter::new(self.store, self.registry);
        if let Some(hook) = self.pre_count_hook {
            counter = counter.with_pre_count_hook(hook);
        }
        let counter = Arc::new(counter);

        let mut templater = MessageTemplater::new(&self.locale);
        if let Some(hook) = self.placeholder_hook {
            templater = templater.with_placeholder_hook(hook);
        }

        debug!(
            enabled = self.settings.enabled,
            limit = self.settings.effective_limit(),
            interval = %self.settings.interval,
            "Order limiter configured"
        );

        Ok(OrderLimiter {
            settings: RwLock::new(self.settings),
            offset,
            week_starts_on,
            clock: self.clock,
            cache: CountCache::new(counter.clone()),
            counter,
            templater,
            window_hook: self.window_hook,
            interval_options_hook: self.interval_options_hook,
        })
    }
}

/// Per-client order limiter.
///
/// Safe to share across request handlers. The host forwards its lifecycle
/// events to [`on_order_created`](Self::on_order_created),
/// [`on_config_changed`](Self::on_config_changed) and
/// [`on_init`](Self::on_init).
pub struct OrderLimiter {
    settings: RwLock<LimiterSettings>,
    offset: FixedOffset,
    week_starts_on: Weekday,
    clock: Arc<dyn Clock>,
    counter: Arc<OrderCounter>,
    cache: CountCache,
    templater: MessageTemplater,
    window_hook: Option<WindowHook>,
    interval_options_hook: Option<IntervalOptionsHook>,
}

impl OrderLimiter {
    /// Start building a limiter over the given order store.
    pub fn builder(store: Arc<dyn OrderStore>, registry: Arc<dyn OrderTypeRegistry>) -> OrderLimiterBuilder {
        OrderLimiterBuilder {
            settings: LimiterSettings::default(),
            locale: StoreLocale::default(),
            store,
            registry,
            clock: Arc::new(SystemClock),
            placeholder_hook: None,
            pre_count_hook: None,
            window_hook: None,
            interval_options_hook: None,
        }
    }

    fn pass(&self) -> Pass {
        let now = self.clock.now().with_timezone(&self.offset);
        let settings = self.settings.read().clone();
        let window = self.window_at(&settings.interval, now);
        Pass { now, settings, window }
    }

    /// The window containing `instant`, after the window hook.
    fn window_at(&self, interval: &IntervalSpec, instant: DateTime<FixedOffset>) -> Window {
        let computed = interval.window(instant, self.week_starts_on);
        let Some(hook) = &self.window_hook else {
            return computed;
        };

        let mut adjusted = computed;
        hook(interval, instant, &mut adjusted);
        if adjusted == computed || adjusted.contains(instant) {
            adjusted
        } else {
            warn!(
                interval = %interval,
                start = %adjusted.start,
                end = %adjusted.end,
                "Ignoring adjusted window that does not contain the current time"
            );
            computed
        }
    }

    /// The current settings.
    pub fn settings(&self) -> LimiterSettings {
        self.settings.read().clone()
    }

    /// Replace the settings, clearing the cached count if counting changed.
    pub fn set_settings(&self, settings: LimiterSettings) {
        let previous = std::mem::replace(&mut *self.settings.write(), settings.clone());
        self.on_config_changed(&previous, &settings);
    }

    /// React to a settings change made elsewhere. Only changes that affect
    /// counting clear the cache.
    pub fn on_config_changed(&self, previous: &LimiterSettings, current: &LimiterSettings) {
        if !previous.affects_count(current) {
            return;
        }
        info!(
            enabled = current.enabled,
            limit = current.effective_limit(),
            interval = %current.interval,
            "Limiter settings changed"
        );
        self.cache.invalidate();
    }

    /// React to a new order by recounting straight away.
    pub async fn on_order_created(&self) -> u64 {
        let pass = self.pass();
        self.cache.refresh(&pass.window, pass.now, pass.limit()).await
    }

    /// Host initialization hook. Retries a refresh deferred because no order
    /// types were registered; returns the new count if one ran.
    pub async fn on_init(&self) -> Option<u64> {
        if !self.cache.take_retry() {
            return None;
        }
        debug!("Retrying deferred order count refresh");
        let pass = self.pass();
        Some(self.cache.refresh(&pass.window, pass.now, pass.limit()).await)
    }

    /// Clear the cached count.
    pub fn reset(&self) {
        info!("Resetting order limiter");
        self.cache.invalidate();
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    pub fn interval(&self) -> IntervalSpec {
        self.settings.read().interval.clone()
    }

    /// The limit in force, or [`UNLIMITED`].
    pub fn get_limit(&self) -> i64 {
        self.settings.read().effective_limit()
    }

    /// The window containing the current instant.
    pub fn window(&self) -> Window {
        self.pass().window
    }

    /// The window that follows the current one. Equal to the current window
    /// for unrecognized intervals.
    pub fn next_window(&self) -> Window {
        let pass = self.pass();
        self.window_at(&pass.settings.interval, pass.window.end)
    }

    pub fn seconds_until_window_end(&self) -> i64 {
        let pass = self.pass();
        pass.window.seconds_until_end(pass.now)
    }

    /// Store-wide qualifying orders this window, from cache when possible.
    pub async fn qualifying_orders(&self) -> u64 {
        let pass = self.pass();
        self.cache.get_or_refresh(&pass.window, pass.now, pass.limit()).await
    }

    /// Orders `ip_address` may still place this window, or [`UNLIMITED`].
    pub async fn remaining_orders(&self, ip_address: &str) -> i64 {
        let pass = self.pass();
        self.remaining_in(&pass, ip_address).await
    }

    pub async fn has_reached_limit(&self, ip_address: &str) -> bool {
        self.remaining_orders(ip_address).await == 0
    }

    /// Whether `ip_address` has placed any counted order this window.
    pub async fn has_orders_in_current_window(&self, ip_address: &str) -> bool {
        let pass = self.pass();
        pass.limit() > self.remaining_in(&pass, ip_address).await
    }

    async fn remaining_in(&self, pass: &Pass, ip_address: &str) -> i64 {
        let limit = pass.limit();
        if !pass.settings.enabled || limit == UNLIMITED {
            return UNLIMITED;
        }

        let count = match self.counter.count_orders(ip_address, pass.counted_since()).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    ip = %ip_address,
                    error = %e,
                    "Failed to count client orders, recounting qualifying orders"
                );
                self.cache.refresh(&pass.window, pass.now, limit).await
            }
        };

        let count = i64::try_from(count).unwrap_or(i64::MAX);
        (limit - count).max(0)
    }

    /// Decide whether `ip_address` may place an order now.
    #[instrument(skip_all, fields(ip = %ip_address))]
    pub async fn evaluate(&self, ip_address: &str) -> Decision {
        let pass = self.pass();
        let remaining = self.remaining_in(&pass, ip_address).await;

        if remaining != 0 {
            debug!(remaining = remaining, "Order allowed");
            return Decision::Allowed { remaining };
        }

        info!(
            limit = pass.limit(),
            interval = %pass.settings.interval,
            window_end = %pass.window.end,
            "Order limit reached, refusing checkout"
        );

        Decision::Blocked(self.blocked_notice(&pass))
    }

    fn blocked_notice(&self, pass: &Pass) -> BlockedNotice {
        let render = |kind| {
            self.templater
                .render_kind(kind, &pass.settings.messages, &pass.window, pass.limit())
        };
        BlockedNotice {
            checkout_error: render(MessageKind::CheckoutError),
            customer_notice: render(MessageKind::CustomerNotice),
            order_button: render(MessageKind::OrderButton),
        }
    }

    /// Render one message for the current window. Unknown kinds render empty.
    pub fn render_message(&self, kind: &str) -> String {
        let pass = self.pass();
        self.templater
            .render(kind, &pass.settings.messages, &pass.window, pass.limit())
    }

    /// The placeholder table for the current window, after hooks.
    pub fn placeholders(&self) -> Placeholders {
        let pass = self.pass();
        self.templater
            .placeholders(&pass.window, pass.limit(), None, "")
    }

    /// Data for the settings screen. `client` is the administrator's own
    /// resolved address, used for the recalculation warning.
    pub async fn describe_settings_ui(&self, client: Option<ClientIp>) -> SettingsDescription {
        let pass = self.pass();
        let placeholders = self
            .templater
            .placeholders(&pass.window, pass.limit(), None, "")
            .into_entries();

        let recalculation_warning = match &client {
            Some(client) => pass.limit() > self.remaining_in(&pass, &client.address).await,
            None => false,
        };

        let qualifying_orders = self
            .cache
            .get_or_refresh(&pass.window, pass.now, pass.limit())
            .await;

        let mut fields = settings_fields(self.week_starts_on, pass.settings.counting);
        if let Some(hook) = &self.interval_options_hook {
            for field in &mut fields {
                if let FieldKind::Select { options } = &mut field.kind {
                    hook(options);
                }
            }
        }

        SettingsDescription {
            fields,
            placeholders,
            recalculation_warning,
            qualifying_orders,
            client_ip: client,
        }
    }
}

impl std::fmt::Debug for OrderLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderLimiter")
            .field("settings", &*self.settings.read())
            .field("offset", &self.offset)
            .field("week_starts_on", &self.week_starts_on)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::{OrderId, OrderQuery, OrderStatus};
    use crate::ratelimit::clock::FixedClock;
    use crate::ratelimit::memory::{InMemoryOrderStore, StaticOrderTypes};
    use crate::ratelimit::settings::{MessageTemplates, SelectOption};
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CLIENT: &str = "203.0.113.7";
    const OTHER_CLIENT: &str = "198.51.100.2";

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    fn daily(limit: i64) -> LimiterSettings {
        LimiterSettings {
            enabled: true,
            limit: Some(limit),
            interval: IntervalSpec::Daily,
            ..Default::default()
        }
    }

    struct Fixture {
        store: Arc<InMemoryOrderStore>,
        clock: Arc<FixedClock>,
        limiter: OrderLimiter,
    }

    impl Fixture {
        fn new(settings: LimiterSettings) -> Self {
            Self::with_registry(settings, Arc::new(StaticOrderTypes::new(["shop_order"])))
        }

        fn with_registry(settings: LimiterSettings, registry: Arc<dyn OrderTypeRegistry>) -> Self {
            let store = Arc::new(InMemoryOrderStore::new());
            let clock = Arc::new(FixedClock::new(utc("2026-03-11T15:00:00Z")));
            let limiter = OrderLimiter::builder(store.clone(), registry)
                .settings(settings)
                .clock(clock.clone())
                .build()
                .unwrap();
            Self { store, clock, limiter }
        }

        fn place(&self, ip: &str, at: &str) {
            self.store
                .insert(OrderStatus::Processing, "shop_order", Some(ip), utc(at));
        }

        fn place_many(&self, ip: &str, count: usize) {
            for i in 0..count {
                self.store.insert(
                    OrderStatus::Completed,
                    "shop_order",
                    Some(ip),
                    utc("2026-03-11T08:00:00Z") + TimeDelta::minutes(i as i64),
                );
            }
        }
    }

    #[tokio::test]
    async fn test_limit_reached_after_five_orders() {
        let fixture = Fixture::new(daily(5));
        fixture.place_many(CLIENT, 5);

        assert!(fixture.limiter.has_reached_limit(CLIENT).await);
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 0);
        assert!(!fixture.limiter.has_reached_limit(OTHER_CLIENT).await);
    }

    #[tokio::test]
    async fn test_remaining_orders_counts_down() {
        let fixture = Fixture::new(daily(5));
        fixture.place_many(CLIENT, 3);

        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 2);
        assert!(fixture.limiter.has_orders_in_current_window(CLIENT).await);
        assert!(!fixture.limiter.has_orders_in_current_window(OTHER_CLIENT).await);
    }

    #[tokio::test]
    async fn test_remaining_orders_never_negative() {
        let fixture = Fixture::new(daily(2));
        fixture.place_many(CLIENT, 6);
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 0);
    }

    #[tokio::test]
    async fn test_orders_before_window_are_ignored() {
        let fixture = Fixture::new(daily(1));
        fixture.place(CLIENT, "2026-03-10T23:59:59Z");
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 1);
    }

    #[tokio::test]
    async fn test_disabled_limiter_is_unlimited() {
        let mut settings = daily(5);
        settings.enabled = false;
        let fixture = Fixture::new(settings);
        fixture.place_many(CLIENT, 10);

        assert_eq!(fixture.limiter.get_limit(), UNLIMITED);
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, UNLIMITED);
        assert!(!fixture.limiter.has_reached_limit(CLIENT).await);
        assert!(!fixture.limiter.has_orders_in_current_window(CLIENT).await);
        assert!(fixture.limiter.evaluate(CLIENT).await.is_allowed());
    }

    #[tokio::test]
    async fn test_negative_limit_is_unlimited() {
        let fixture = Fixture::new(daily(-1));
        fixture.place_many(CLIENT, 3);
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, UNLIMITED);
    }

    #[tokio::test]
    async fn test_zero_limit_blocks_everyone() {
        let fixture = Fixture::new(daily(0));
        assert!(fixture.limiter.has_reached_limit(OTHER_CLIENT).await);
    }

    #[tokio::test]
    async fn test_evaluate_blocks_with_rendered_messages() {
        let mut settings = daily(2);
        settings.interval = IntervalSpec::Hourly;
        settings.messages = MessageTemplates {
            checkout_error: Some("{limit} orders max, resets {next_interval}".to_string()),
            customer_notice: None,
            order_button: Some("Back at {next_interval:time}".to_string()),
        };
        let fixture = Fixture::new(settings);
        fixture.place(CLIENT, "2026-03-11T15:00:00Z");

        let decision = fixture.limiter.evaluate(CLIENT).await;
        assert_eq!(decision, Decision::Allowed { remaining: 1 });

        fixture.place(CLIENT, "2026-03-11T15:00:00Z");
        let decision = fixture.limiter.evaluate(CLIENT).await;
        assert!(!decision.is_allowed());
        assert_eq!(decision.remaining(), 0);
        assert_eq!(decision.message_if_blocked(), Some("2 orders max, resets 4:00 pm"));

        match &decision {
            Decision::Blocked(notice) => {
                assert_eq!(notice.customer_notice, crate::ratelimit::message::DEFAULT_MESSAGE);
                assert_eq!(notice.order_button, "Back at 4:00 pm");
            }
            other => panic!("expected a blocked decision, got {:?}", other),
        }

        match decision.into_checkout_result() {
            Err(OrderGuardError::OrdersNotAccepted(message)) => {
                assert_eq!(message, "2 orders max, resets 4:00 pm")
            }
            other => panic!("expected OrdersNotAccepted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_window_rollover_unblocks() {
        let mut settings = daily(1);
        settings.interval = IntervalSpec::Hourly;
        let fixture = Fixture::new(settings);
        fixture.place(CLIENT, "2026-03-11T15:10:00Z");

        fixture.clock.set(utc("2026-03-11T15:59:59Z"));
        assert!(!fixture.limiter.evaluate(CLIENT).await.is_allowed());

        let next = fixture.limiter.next_window();
        assert_eq!(next.start, fixture.limiter.window().end);
        assert_eq!(next.duration(), TimeDelta::hours(1));

        fixture.clock.advance(TimeDelta::seconds(1));
        assert_eq!(fixture.limiter.window(), next);
        assert_eq!(fixture.limiter.evaluate(CLIENT).await, Decision::Allowed { remaining: 1 });
    }

    #[tokio::test]
    async fn test_rolling_counting_looks_back_one_interval() {
        let mut settings = daily(1);
        settings.counting = CountingMode::Rolling;
        let fixture = Fixture::new(settings);
        // Yesterday, but within the last 24 hours
        fixture.place(CLIENT, "2026-03-10T20:00:00Z");

        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 0);

        fixture.clock.set(utc("2026-03-11T20:00:01Z"));
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 1);
    }

    #[tokio::test]
    async fn test_store_timezone_shifts_window() {
        let store = Arc::new(InMemoryOrderStore::new());
        let clock = Arc::new(FixedClock::new(utc("2026-03-11T02:00:00Z")));
        let limiter = OrderLimiter::builder(store.clone(), Arc::new(StaticOrderTypes::new(["shop_order"])))
            .settings(daily(1))
            .locale(StoreLocale {
                utc_offset_minutes: -5 * 60,
                ..Default::default()
            })
            .clock(clock)
            .build()
            .unwrap();

        // 21:00 on March 10th in the store's timezone
        assert_eq!(
            limiter.window().start,
            DateTime::parse_from_rfc3339("2026-03-10T00:00:00-05:00").unwrap()
        );
        store.insert(OrderStatus::Pending, "shop_order", Some(CLIENT), utc("2026-03-10T06:00:00Z"));
        assert!(limiter.has_reached_limit(CLIENT).await);
    }

    #[tokio::test]
    async fn test_on_order_created_refreshes_cache() {
        let fixture = Fixture::new(daily(5));
        fixture.place(CLIENT, "2026-03-11T09:00:00Z");
        fixture.place(OTHER_CLIENT, "2026-03-11T10:00:00Z");

        assert_eq!(fixture.limiter.on_order_created().await, 2);
        fixture.place(OTHER_CLIENT, "2026-03-11T11:00:00Z");
        assert_eq!(fixture.limiter.qualifying_orders().await, 2);
        assert_eq!(fixture.limiter.on_order_created().await, 3);
    }

    #[tokio::test]
    async fn test_config_change_invalidates_only_on_difference() {
        let fixture = Fixture::new(daily(5));
        fixture.place(CLIENT, "2026-03-11T09:00:00Z");
        fixture.limiter.on_order_created().await;
        fixture.place(CLIENT, "2026-03-11T10:00:00Z");

        fixture.limiter.set_settings(daily(5));
        assert_eq!(fixture.limiter.qualifying_orders().await, 1);

        let mut reworded = daily(5);
        reworded.messages.checkout_error = Some("Come back tomorrow".to_string());
        fixture.limiter.set_settings(reworded);
        assert_eq!(fixture.limiter.qualifying_orders().await, 1);
        assert_eq!(fixture.limiter.render_message("checkout_error"), "Come back tomorrow");

        fixture.limiter.set_settings(daily(6));
        assert_eq!(fixture.limiter.get_limit(), 6);
        assert_eq!(fixture.limiter.qualifying_orders().await, 2);
    }

    #[tokio::test]
    async fn test_reset_clears_cached_count() {
        let fixture = Fixture::new(daily(5));
        fixture.limiter.on_order_created().await;
        fixture.place(CLIENT, "2026-03-11T10:00:00Z");
        assert_eq!(fixture.limiter.qualifying_orders().await, 0);

        fixture.limiter.reset();
        assert_eq!(fixture.limiter.qualifying_orders().await, 1);
    }

    struct TogglingRegistry {
        ready: AtomicBool,
    }

    #[async_trait]
    impl OrderTypeRegistry for TogglingRegistry {
        async fn recognized_order_types(&self) -> BTreeSet<String> {
            if self.ready.load(Ordering::SeqCst) {
                BTreeSet::from(["shop_order".to_string()])
            } else {
                BTreeSet::new()
            }
        }
    }

    #[tokio::test]
    async fn test_empty_order_types_deferred_until_init() {
        let registry = Arc::new(TogglingRegistry {
            ready: AtomicBool::new(false),
        });
        let fixture = Fixture::with_registry(daily(5), registry.clone());
        fixture.place(CLIENT, "2026-03-11T09:00:00Z");

        assert_eq!(fixture.limiter.on_order_created().await, 0);
        assert_eq!(fixture.limiter.on_init().await, Some(0));
        assert_eq!(fixture.limiter.on_init().await, Some(0));

        registry.ready.store(true, Ordering::SeqCst);
        assert_eq!(fixture.limiter.on_init().await, Some(1));
        assert_eq!(fixture.limiter.on_init().await, None);
    }

    struct FailingStore {
        inner: InMemoryOrderStore,
    }

    #[async_trait]
    impl OrderStore for FailingStore {
        async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<OrderId>> {
            if query.ip_address.is_some() {
                return Err(OrderGuardError::Store("query timed out".to_string()));
            }
            self.inner.find_orders(query).await
        }
    }

    #[tokio::test]
    async fn test_count_failure_falls_back_to_qualifying_count() {
        let inner = InMemoryOrderStore::new();
        inner.insert(OrderStatus::Completed, "shop_order", Some(OTHER_CLIENT), utc("2026-03-11T09:00:00Z"));
        inner.insert(OrderStatus::Completed, "shop_order", Some(OTHER_CLIENT), utc("2026-03-11T10:00:00Z"));
        let limiter = OrderLimiter::builder(
            Arc::new(FailingStore { inner }),
            Arc::new(StaticOrderTypes::new(["shop_order"])),
        )
        .settings(daily(5))
        .clock(Arc::new(FixedClock::new(utc("2026-03-11T15:00:00Z"))))
        .build()
        .unwrap();

        assert_eq!(limiter.remaining_orders(CLIENT).await, 3);
    }

    #[tokio::test]
    async fn test_minute_interval_not_dividing_an_hour_still_limits() {
        let mut settings = daily(1);
        settings.interval = IntervalSpec::parse("min45");
        let fixture = Fixture::new(settings);
        fixture.store.insert(
            OrderStatus::Completed,
            "shop_order",
            Some(CLIENT),
            utc("2026-03-11T14:50:00Z"),
        );

        assert_eq!(fixture.limiter.interval(), IntervalSpec::Minutes(45));
        assert_eq!(fixture.limiter.window().start, utc("2026-03-11T14:15:30Z"));
        assert_eq!(fixture.limiter.seconds_until_window_end(), 30);
        assert!(!fixture.limiter.evaluate(CLIENT).await.is_allowed());

        fixture.clock.set(utc("2026-03-11T15:00:30Z"));
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 1);
    }

    struct SwitchableStore {
        inner: InMemoryOrderStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl OrderStore for SwitchableStore {
        async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<OrderId>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(OrderGuardError::Store("connection refused".to_string()));
            }
            self.inner.find_orders(query).await
        }
    }

    #[tokio::test]
    async fn test_count_and_recount_failure_uses_last_cached_count() {
        let store = Arc::new(SwitchableStore {
            inner: InMemoryOrderStore::new(),
            failing: AtomicBool::new(false),
        });
        for hour in 9..12 {
            store.inner.insert(
                OrderStatus::Completed,
                "shop_order",
                Some(OTHER_CLIENT),
                utc("2026-03-11T00:00:00Z") + TimeDelta::hours(hour),
            );
        }
        let limiter = OrderLimiter::builder(store.clone(), Arc::new(StaticOrderTypes::new(["shop_order"])))
            .settings(daily(5))
            .clock(Arc::new(FixedClock::new(utc("2026-03-11T15:00:00Z"))))
            .build()
            .unwrap();

        assert_eq!(limiter.on_order_created().await, 3);
        store.failing.store(true, Ordering::SeqCst);

        assert_eq!(limiter.remaining_orders(CLIENT).await, 2);
        assert_eq!(limiter.on_init().await, None);

        limiter.reset();
        assert_eq!(limiter.remaining_orders(CLIENT).await, 5);
        assert_eq!(limiter.on_init().await, None);
    }

    /// Business days running from 06:00 to 06:00 UTC.
    fn business_day_hook() -> WindowHook {
        Arc::new(|interval: &IntervalSpec, instant: DateTime<FixedOffset>, window: &mut Window| {
            if *interval != IntervalSpec::Daily {
                return;
            }
            let shift = TimeDelta::hours(6);
            let shifted = if instant >= window.start + shift {
                window.start + shift
            } else {
                window.start - TimeDelta::days(1) + shift
            };
            window.start = shifted;
            window.end = shifted + TimeDelta::days(1);
        })
    }

    #[tokio::test]
    async fn test_window_hook_moves_boundaries() {
        let store = Arc::new(InMemoryOrderStore::new());
        let limiter = OrderLimiter::builder(store.clone(), Arc::new(StaticOrderTypes::new(["shop_order"])))
            .settings(daily(1))
            .window_hook(business_day_hook())
            .clock(Arc::new(FixedClock::new(utc("2026-03-11T15:00:00Z"))))
            .build()
            .unwrap();

        assert_eq!(limiter.window().start, utc("2026-03-11T06:00:00Z"));
        assert_eq!(limiter.next_window().start, utc("2026-03-12T06:00:00Z"));
        assert_eq!(limiter.seconds_until_window_end(), 15 * 3600);

        store.insert(OrderStatus::Completed, "shop_order", Some(CLIENT), utc("2026-03-11T05:00:00Z"));
        assert_eq!(limiter.remaining_orders(CLIENT).await, 1);

        store.insert(OrderStatus::Completed, "shop_order", Some(CLIENT), utc("2026-03-11T07:00:00Z"));
        assert!(limiter.has_reached_limit(CLIENT).await);
    }

    #[tokio::test]
    async fn test_window_hook_result_must_contain_now() {
        let hook: WindowHook = Arc::new(
            |_interval: &IntervalSpec, instant: DateTime<FixedOffset>, window: &mut Window| {
                window.start = instant - TimeDelta::days(3);
                window.end = instant - TimeDelta::days(2);
            },
        );
        let limiter = OrderLimiter::builder(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(StaticOrderTypes::new(["shop_order"])),
        )
        .settings(daily(1))
        .window_hook(hook)
        .clock(Arc::new(FixedClock::new(utc("2026-03-11T15:00:00Z"))))
        .build()
        .unwrap();

        assert_eq!(limiter.window().start, utc("2026-03-11T00:00:00Z"));
        assert_eq!(limiter.window().end, utc("2026-03-12T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_unrecognized_interval_counts_nothing() {
        let mut settings = daily(1);
        settings.interval = IntervalSpec::parse("sometimes");
        let fixture = Fixture::new(settings);
        fixture.place(CLIENT, "2026-03-11T14:00:00Z");

        assert!(fixture.limiter.window().is_zero_width());
        assert_eq!(fixture.limiter.next_window(), fixture.limiter.window());
        assert_eq!(fixture.limiter.seconds_until_window_end(), 0);
        assert_eq!(fixture.limiter.remaining_orders(CLIENT).await, 1);
    }

    #[tokio::test]
    async fn test_render_message_and_placeholders() {
        let mut settings = daily(10);
        settings.interval = IntervalSpec::Hourly;
        settings.messages.customer_notice = Some("Limit: {limit}".to_string());
        let fixture = Fixture::new(settings);

        assert_eq!(fixture.limiter.render_message("customer_notice"), "Limit: 10");
        assert_eq!(fixture.limiter.render_message("nonsense"), "");
        assert_eq!(fixture.limiter.placeholders().get("{next_interval}"), Some("4:00 pm"));
    }

    #[tokio::test]
    async fn test_placeholder_hook_reaches_messages() {
        let store = Arc::new(InMemoryOrderStore::new());
        let hook: PlaceholderHook = Arc::new(
            |placeholders: &mut Placeholders, _kind: Option<MessageKind>, _template: &str| {
                placeholders.insert("{support}", "help@example.com");
            },
        );
        let mut settings = daily(0);
        settings.messages.checkout_error = Some("Contact {support}".to_string());
        let limiter = OrderLimiter::builder(store, Arc::new(StaticOrderTypes::new(["shop_order"])))
            .settings(settings)
            .placeholder_hook(hook)
            .clock(Arc::new(FixedClock::new(utc("2026-03-11T15:00:00Z"))))
            .build()
            .unwrap();

        let decision = limiter.evaluate(CLIENT).await;
        assert_eq!(decision.message_if_blocked(), Some("Contact help@example.com"));
    }

    #[tokio::test]
    async fn test_describe_settings_ui() {
        let fixture = Fixture::new(daily(5));
        fixture.place(CLIENT, "2026-03-11T09:00:00Z");
        fixture.place(OTHER_CLIENT, "2026-03-11T10:00:00Z");

        let client = ClientIp {
            header: "X-Real-IP".to_string(),
            address: CLIENT.to_string(),
        };
        let description = fixture.limiter.describe_settings_ui(Some(client.clone())).await;

        assert_eq!(description.fields.len(), 6);
        assert_eq!(description.placeholders.len(), 8);
        assert!(description.recalculation_warning);
        assert_eq!(description.qualifying_orders, 2);
        assert_eq!(description.client_ip, Some(client));

        let description = fixture.limiter.describe_settings_ui(None).await;
        assert!(!description.recalculation_warning);
    }

    #[tokio::test]
    async fn test_describe_settings_ui_interval_options() {
        let mut settings = daily(5);
        settings.counting = CountingMode::Rolling;
        let hook: IntervalOptionsHook = Arc::new(|options: &mut Vec<SelectOption>| {
            options.push(SelectOption {
                value: IntervalSpec::Minutes(45).key(),
                label: "Last 45 minutes".to_string(),
            });
        });
        let limiter = OrderLimiter::builder(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(StaticOrderTypes::new(["shop_order"])),
        )
        .settings(settings)
        .interval_options_hook(hook)
        .clock(Arc::new(FixedClock::new(utc("2026-03-11T15:00:00Z"))))
        .build()
        .unwrap();

        let description = limiter.describe_settings_ui(None).await;
        let interval = description
            .fields
            .iter()
            .find(|field| field.id == "interval")
            .unwrap();
        match &interval.kind {
            FieldKind::Select { options } => {
                assert_eq!(options.len(), 8);
                assert_eq!(options[4].label, "Last day (24 hours)");
                assert_eq!(options[7].value, "min45");
            }
            other => panic!("unexpected field kind: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_locale_rejected() {
        let result = OrderLimiter::builder(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(StaticOrderTypes::default()),
        )
        .locale(StoreLocale {
            week_starts_on: 9,
            ..Default::default()
        })
        .build();
        assert!(matches!(result, Err(OrderGuardError::Config(_))));
    }

    proptest! {
        #[test]
        fn prop_remaining_decreases_until_clamped(limit in 0i64..20, orders in 0usize..30) {
            let fixture = Fixture::new(daily(limit));
            let mut previous = fixture_remaining(&fixture);
            prop_assert_eq!(previous, limit);

            for _ in 0..orders {
                fixture.place(CLIENT, "2026-03-11T12:00:00Z");
                let remaining = fixture_remaining(&fixture);
                prop_assert!(remaining >= 0);
                prop_assert!(remaining <= previous);
                prop_assert!(remaining == 0 || remaining == previous - 1);
                previous = remaining;
            }
        }
    }

    fn fixture_remaining(fixture: &Fixture) -> i64 {
        tokio_test::block_on(fixture.limiter.remaining_orders(CLIENT))
    }
}
