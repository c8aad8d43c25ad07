//! Order rate limiting: windows, counting, caching and decisions.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod counter;
pub mod interval;
pub mod limiter;
pub mod memory;
pub mod message;
pub mod settings;

pub use backend::{OrderQuery, OrderStatus, OrderStore, OrderTypeRegistry};
pub use clock::{Clock, FixedClock, SystemClock};
pub use interval::{IntervalSpec, Window, WindowHook};
pub use limiter::{BlockedNotice, Decision, OrderLimiter, OrderLimiterBuilder};
pub use memory::{InMemoryOrderStore, StaticOrderTypes};
pub use message::{MessageKind, Placeholders};
pub use settings::{
    CountingMode, IntervalOptionsHook, LimiterSettings, MessageTemplates, SettingsDescription, UNLIMITED,
};
