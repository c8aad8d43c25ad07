//! Limiter settings and their description for settings screens.

use std::sync::Arc;

use chrono::Weekday;
use serde::{Deserialize, Deserializer, Serialize};

use super::interval::IntervalSpec;
use super::message::{MessageKind, PlaceholderEntry};
use crate::identity::ClientIp;

/// Limit value meaning "no cap applies", for both limits and remaining orders.
pub const UNLIMITED: i64 = -1;

/// Where the per-client count starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountingMode {
    /// Count orders since the current window started
    #[default]
    Calendar,
    /// Count orders within a trailing lookback of one interval ending now
    Rolling,
}

/// Customer-facing message templates. `None` falls back to the default message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplates {
    #[serde(default)]
    pub customer_notice: Option<String>,
    #[serde(default)]
    pub order_button: Option<String>,
    #[serde(default)]
    pub checkout_error: Option<String>,
}

impl MessageTemplates {
    pub fn get(&self, kind: MessageKind) -> Option<&str> {
        match kind {
            MessageKind::CustomerNotice => self.customer_notice.as_deref(),
            MessageKind::OrderButton => self.order_button.as_deref(),
            MessageKind::CheckoutError => self.checkout_error.as_deref(),
        }
    }
}

/// Order limiting settings as configured by the store administrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Whether limiting is switched on
    #[serde(default)]
    pub enabled: bool,

    /// Maximum orders per client per window. Negative or non-numeric values
    /// mean unlimited.
    #[serde(default, deserialize_with = "deserialize_limit")]
    pub limit: Option<i64>,

    /// How often the allowance resets
    #[serde(default)]
    pub interval: IntervalSpec,

    /// Where per-client counting starts
    #[serde(default)]
    pub counting: CountingMode,

    /// Messages shown once a client is blocked
    #[serde(default)]
    pub messages: MessageTemplates,
}

impl LimiterSettings {
    /// The limit in force, or [`UNLIMITED`] when disabled or not a usable number.
    pub fn effective_limit(&self) -> i64 {
        match self.limit {
            Some(limit) if self.enabled && limit >= 0 => limit,
            _ => UNLIMITED,
        }
    }

    /// Whether switching between `self` and `other` changes what is counted.
    /// Message edits do not.
    pub fn affects_count(&self, other: &LimiterSettings) -> bool {
        self.enabled != other.enabled
            || self.limit != other.limit
            || self.interval != other.interval
            || self.counting != other.counting
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Int(i64),
    Float(f64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

impl RawLimit {
    fn into_limit(self) -> Option<i64> {
        match self {
            RawLimit::Int(limit) => Some(limit),
            RawLimit::Float(limit) if limit.is_finite() => Some(limit.trunc() as i64),
            RawLimit::Text(text) => {
                let text = text.trim();
                text.parse::<i64>().ok().or_else(|| {
                    text.parse::<f64>()
                        .ok()
                        .filter(|limit| limit.is_finite())
                        .map(|limit| limit.trunc() as i64)
                })
            }
            _ => None,
        }
    }
}

fn deserialize_limit<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawLimit>::deserialize(deserializer)?;
    Ok(raw.and_then(RawLimit::into_limit))
}

/// Default text suggested for the notice and button fields.
pub const DEFAULT_NOTICE_TEMPLATE: &str =
    "You can place up to {limit} orders per period. Please try again after {next_interval}.";

/// Default text suggested for the checkout error field.
pub const DEFAULT_CHECKOUT_ERROR_TEMPLATE: &str = "Ordering is temporarily disabled for this store.";

/// A selectable option of a [`FieldKind::Select`] field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

/// Input type of a settings field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Checkbox { default: bool },
    Number { min: i64, step: i64 },
    Select { options: Vec<SelectOption> },
    Text { default: String },
}

/// One configurable field on the settings screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsField {
    pub id: String,
    pub label: String,
    pub description: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

/// Everything a settings screen needs to render the limiter's options.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsDescription {
    pub fields: Vec<SettingsField>,
    /// Placeholders usable in message templates, with their current values
    pub placeholders: Vec<PlaceholderEntry>,
    /// Orders have already been counted this window, so saving new settings
    /// recalculates live limits
    pub recalculation_warning: bool,
    /// Store-wide qualifying orders in the current window
    pub qualifying_orders: u64,
    /// The client address as the limiter sees it, when known
    pub client_ip: Option<ClientIp>,
}

/// Adjusts the interval choices before they are shown, e.g. to offer extra
/// `min<N>` intervals.
pub type IntervalOptionsHook = Arc<dyn Fn(&mut Vec<SelectOption>) + Send + Sync>;

/// Interval choices offered on the settings screen, labelled for how orders
/// are counted.
pub fn interval_options(week_starts_on: Weekday, counting: CountingMode) -> Vec<SelectOption> {
    let option = |interval: IntervalSpec, label: String| SelectOption {
        value: interval.key(),
        label,
    };

    match counting {
        CountingMode::Calendar => vec![
            option(IntervalSpec::Minutes(5), "Every 5 minutes".to_string()),
            option(IntervalSpec::Minutes(15), "Every 15 minutes".to_string()),
            option(IntervalSpec::Minutes(30), "Every 30 minutes".to_string()),
            option(IntervalSpec::Hourly, "Hourly".to_string()),
            option(IntervalSpec::Daily, "Daily".to_string()),
            option(
                IntervalSpec::Weekly,
                format!("Weekly, starting {}", weekday_name(week_starts_on)),
            ),
            option(IntervalSpec::Monthly, "Monthly".to_string()),
        ],
        CountingMode::Rolling => vec![
            option(IntervalSpec::Minutes(5), "Last 5 minutes".to_string()),
            option(IntervalSpec::Minutes(15), "Last 15 minutes".to_string()),
            option(IntervalSpec::Minutes(30), "Last 30 minutes".to_string()),
            option(IntervalSpec::Hourly, "Last hour".to_string()),
            option(IntervalSpec::Daily, "Last day (24 hours)".to_string()),
            option(IntervalSpec::Weekly, "Last 7 days".to_string()),
            option(IntervalSpec::Monthly, "Last 30 days".to_string()),
        ],
    }
}

/// The configurable fields, in display order.
pub fn settings_fields(week_starts_on: Weekday, counting: CountingMode) -> Vec<SettingsField> {
    vec![
        SettingsField {
            id: "enabled".to_string(),
            label: "Enable order limiting".to_string(),
            description: "Refuse new orders from a client once the maximum number of orders has \
                          been placed within the period"
                .to_string(),
            kind: FieldKind::Checkbox { default: false },
        },
        SettingsField {
            id: "limit".to_string(),
            label: "Maximum orders".to_string(),
            description: "Orders a client may place per period. Set -1 for no limit".to_string(),
            kind: FieldKind::Number { min: 0, step: 1 },
        },
        SettingsField {
            id: "interval".to_string(),
            label: "Period".to_string(),
            description: "How often each client's allowance resets".to_string(),
            kind: FieldKind::Select {
                options: interval_options(week_starts_on, counting),
            },
        },
        SettingsField {
            id: MessageKind::CustomerNotice.key().to_string(),
            label: "Customer notice".to_string(),
            description: "Shown on shop pages while ordering is disabled".to_string(),
            kind: FieldKind::Text {
                default: DEFAULT_NOTICE_TEMPLATE.to_string(),
            },
        },
        SettingsField {
            id: MessageKind::OrderButton.key().to_string(),
            label: "\"Place order\" button".to_string(),
            description: "Replaces the place order button on the checkout screen".to_string(),
            kind: FieldKind::Text {
                default: DEFAULT_NOTICE_TEMPLATE.to_string(),
            },
        },
        SettingsField {
            id: MessageKind::CheckoutError.key().to_string(),
            label: "Checkout error message".to_string(),
            description: "Shown if a blocked client attempts to check out".to_string(),
            kind: FieldKind::Text {
                default: DEFAULT_CHECKOUT_ERROR_TEMPLATE.to_string(),
            },
        },
    ]
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
