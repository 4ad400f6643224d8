//! Outbound notification hook. Fire-and-forget: delivery runs on a spawned
//! task, never blocks the mutating path, and never fails the caller's
//! transaction. Formatting and fan-out live outside the core.

use serde::Serialize;

use crate::logging::{json_log, obj, v_str, Domain};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyEvent {
    NewApplicant { room_id: String, user_id: String },
    RoomHot { room_id: String },
    ApplicationAccepted { application_id: String, room_id: String, user_id: String },
    ApplicationRejected { application_id: String, room_id: String, user_id: String },
    DepositRefunded { room_id: String, user_id: String, amount: u64 },
    DepositForfeited { room_id: String, user_id: String, amount: u64 },
}

pub trait Notifier: Send + Sync {
    /// Must return immediately; implementations deliver in the background.
    fn notify(&self, event: NotifyEvent);
}

/// Drops every event. Default for tests and library embedding.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: NotifyEvent) {}
}

/// Posts each event as JSON to a webhook. Requires a tokio runtime; delivery
/// failures are logged and swallowed.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self { client: reqwest::Client::new(), url: url.to_string() }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: NotifyEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let result = client.post(&url).json(&event).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    json_log(
                        Domain::System,
                        "notify.delivery_failed",
                        obj(&[("status", v_str(resp.status().as_str()))]),
                    );
                }
                Err(err) => {
                    json_log(
                        Domain::System,
                        "notify.delivery_failed",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                }
            }
        });
    }
}

/// Records events in memory; used by tests to assert on the hook surface.
pub struct RecordingNotifier {
    pub events: std::sync::Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self { events: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn drain(&self) -> Vec<NotifyEvent> {
        self.events.lock().map(|mut e| e.drain(..).collect()).unwrap_or_default()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: NotifyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
