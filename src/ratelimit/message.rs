//! Customer-facing messages shown while ordering is blocked.
//!
//! Templates may contain placeholders such as `{limit}` or
//! `{next_interval:time}`, which are filled in from the current and next
//! window. Operators can add or override placeholders through a
//! [`PlaceholderHook`].

use std::fmt::Write;
use std::sync::Arc;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, TimeDelta};
use serde::Serialize;

use super::interval::Window;
use super::settings::MessageTemplates;
use crate::config::StoreLocale;

/// Shown when no template has been configured.
pub const DEFAULT_MESSAGE: &str = "Ordering is currently disabled for this store.";

/// The message slots a host can display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    CheckoutError,
    CustomerNotice,
    OrderButton,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::CheckoutError,
        MessageKind::CustomerNotice,
        MessageKind::OrderButton,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            MessageKind::CheckoutError => "checkout_error",
            MessageKind::CustomerNotice => "customer_notice",
            MessageKind::OrderButton => "order_button",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }
}

/// A placeholder token and the text it is replaced with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceholderEntry {
    pub token: String,
    pub value: String,
}

/// Ordered placeholder table. Substitution follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Placeholders {
    entries: Vec<PlaceholderEntry>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a placeholder, replacing the value of an existing token in place.
    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        let token = token.into();
        let value = value.into();
        match self.entries.iter_mut().find(|entry| entry.token == token) {
            Some(entry) => entry.value = value,
            None => self.entries.push(PlaceholderEntry { token, value }),
        }
    }

    pub fn remove(&mut self, token: &str) -> Option<String> {
        let index = self.entries.iter().position(|entry| entry.token == token)?;
        Some(self.entries.remove(index).value)
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.token == token)
            .map(|entry| entry.value.as_str())
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.token.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every token in `template`.
    pub fn apply(&self, template: &str) -> String {
        self.entries
            .iter()
            .fold(template.to_string(), |text, entry| text.replace(&entry.token, &entry.value))
    }

    pub fn into_entries(self) -> Vec<PlaceholderEntry> {
        self.entries
    }
}

/// Adjusts the placeholder table before substitution. Receives the message
/// kind being rendered (if any) and its raw template.
pub type PlaceholderHook = Arc<dyn Fn(&mut Placeholders, Option<MessageKind>, &str) + Send + Sync>;

/// Renders message templates for a window.
#[derive(Clone)]
pub struct MessageTemplater {
    date_format: String,
    time_format: String,
    timezone_label: Option<String>,
    hook: Option<PlaceholderHook>,
}

impl MessageTemplater {
    pub fn new(locale: &StoreLocale) -> Self {
        Self {
            date_format: locale.date_format.clone(),
            time_format: locale.time_format.clone(),
            timezone_label: locale.timezone_label.clone(),
            hook: None,
        }
    }

    pub fn with_placeholder_hook(mut self, hook: PlaceholderHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Build the placeholder table for `window`.
    ///
    /// `{current_interval}` and `{next_interval}` render as a time when
    /// windows are shorter than a day, otherwise as a date.
    pub fn placeholders(
        &self,
        window: &Window,
        limit: i64,
        kind: Option<MessageKind>,
        template: &str,
    ) -> Placeholders {
        let current = window.start;
        let next = window.end;
        let within_day = next - current < TimeDelta::days(1);
        let short_format = if within_day {
            &self.time_format
        } else {
            &self.date_format
        };

        let mut placeholders = Placeholders::new();
        placeholders.insert("{current_interval}", format_instant(current, short_format));
        placeholders.insert("{current_interval:date}", format_instant(current, &self.date_format));
        placeholders.insert("{current_interval:time}", format_instant(current, &self.time_format));
        placeholders.insert("{limit}", limit.to_string());
        placeholders.insert("{next_interval}", format_instant(next, short_format));
        placeholders.insert("{next_interval:date}", format_instant(next, &self.date_format));
        placeholders.insert("{next_interval:time}", format_instant(next, &self.time_format));
        placeholders.insert(
            "{timezone}",
            self.timezone_label
                .clone()
                .unwrap_or_else(|| format_instant(next, "UTC%:z")),
        );

        if let Some(hook) = &self.hook {
            hook(&mut placeholders, kind, template);
        }

        placeholders
    }

    /// Render the message stored under `kind`. Unknown kinds render as an
    /// empty string.
    pub fn render(&self, kind: &str, templates: &MessageTemplates, window: &Window, limit: i64) -> String {
        match MessageKind::parse(kind) {
            Some(kind) => self.render_kind(kind, templates, window, limit),
            None => String::new(),
        }
    }

    pub fn render_kind(
        &self,
        kind: MessageKind,
        templates: &MessageTemplates,
        window: &Window,
        limit: i64,
    ) -> String {
        let template = templates.get(kind).unwrap_or(DEFAULT_MESSAGE);
        self.placeholders(window, limit, Some(kind), template)
            .apply(template)
    }
}

impl std::fmt::Debug for MessageTemplater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTemplater")
            .field("date_format", &self.date_format)
            .field("time_format", &self.time_format)
            .field("timezone_label", &self.timezone_label)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Whether `format` is a strftime pattern chrono can render.
pub fn is_valid_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

fn format_instant(instant: DateTime<FixedOffset>, format: &str) -> String {
    let mut rendered = String::new();
    match write!(rendered, "{}", instant.format(format)) {
        Ok(()) => rendered,
        Err(_) => instant.to_rfc3339(),
    }
}
