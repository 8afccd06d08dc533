use crate::email_client::EmailClient;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

static ALERT_NOTIFIER: Lazy<AlertNotifier> = Lazy::new(AlertNotifier::new);

const RATE_LIMIT_MIN_GAP: Duration = Duration::from_secs(600);
const INCOMPLETE_CLOSE_MIN_GAP: Duration = Duration::from_secs(600);

/// Partial spreads, reconciliation outcomes and other conditions that need a human.
pub fn notify_operator(context: &str, detail: &str) {
    ALERT_NOTIFIER.notify(context, detail);
}

/// A close that left tickets open. Retries of the same setup inside ten minutes
/// are only logged.
pub fn notify_incomplete_close(setup_id: &str, detail: &str) {
    ALERT_NOTIFIER.notify_incomplete_close(setup_id, detail);
}

/// Broker throttling. Repeats inside ten minutes are only logged.
pub fn notify_rate_limit(context: &str, detail: &str) {
    ALERT_NOTIFIER.notify_rate_limit(context, detail);
}

/// Per-key minimum gap between e-mails.
struct AlertGate {
    gap: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl AlertGate {
    fn new(gap: Duration) -> Self {
        Self {
            gap,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True when `key` has not been let through within the gap; arms the gate.
    fn due(&self, key: &str, now: Instant) -> bool {
        let Ok(mut last) = self.last.lock() else {
            return true;
        };
        let due = last
            .get(key)
            .map(|t| now.saturating_duration_since(*t) >= self.gap)
            .unwrap_or(true);
        if due {
            last.insert(key.to_string(), now);
        }
        due
    }
}

struct AlertNotifier {
    pair_name: String,
    rate_limit: AlertGate,
    incomplete_close: AlertGate,
}

impl AlertNotifier {
    fn new() -> Self {
        let pair_name = match (
            std::env::var("PRIMARY_SYMBOL"),
            std::env::var("SECONDARY_SYMBOL"),
        ) {
            (Ok(a), Ok(b)) => format!("{}/{}", a, b),
            _ => String::new(),
        };
        Self {
            pair_name,
            rate_limit: AlertGate::new(RATE_LIMIT_MIN_GAP),
            incomplete_close: AlertGate::new(INCOMPLETE_CLOSE_MIN_GAP),
        }
    }

    fn subject(&self, kind: &str, context: &str) -> String {
        if self.pair_name.is_empty() {
            format!("[{}] {}", kind, context)
        } else {
            format!("[{}] {} - {}", self.pair_name, kind, context)
        }
    }

    fn notify(&self, context: &str, detail: &str) {
        let subject = self.subject("Alert", context);
        let sent = EmailClient::new().send(&subject, detail);
        log::warn!(
            "[ALERT] {} (detail: {}, emailed: {})",
            context,
            detail,
            sent
        );
    }

    fn notify_incomplete_close(&self, setup_id: &str, detail: &str) {
        if !self.incomplete_close.due(setup_id, Instant::now()) {
            log::warn!("[ALERT] setup close incomplete again (detail: {})", detail);
            return;
        }
        self.notify("setup close incomplete", detail);
    }

    fn notify_rate_limit(&self, context: &str, detail: &str) {
        if !self.rate_limit.due("rate_limit", Instant::now()) {
            log::warn!("[RateLimit] {} (detail: {})", context, detail);
            return;
        }
        let subject = self.subject("RateLimit", context);
        let body = format!(
            "Broker rate limit detected while {}.\nDetail: {}",
            context, detail
        );
        EmailClient::new().send(&subject, &body);
        log::warn!(
            "[RateLimit] notification sent for '{}' (detail: {})",
            context,
            detail
        );
    }
}
