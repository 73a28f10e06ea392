//! Exceedance notifications (fire-and-forget)
//!
//! The ingestion gate spawns dispatch after the reading is persisted; a
//! failing dispatcher is logged and never affects ingestion.

use super::calibration::ExceededParameter;
use super::types::Contact;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceedanceEvent {
    pub entity_id: String,
    pub product_id: String,
    pub company_name: String,
    pub category: Option<String>,
    pub contact: Contact,
    pub exceeded: Vec<ExceededParameter>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub enum NotifyError {
    Http(String),
    Rejected(u16),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Http(e) => write!(f, "HTTP error: {}", e),
            NotifyError::Rejected(status) => write!(f, "Notification rejected with status {}", status),
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Http(err.to_string())
    }
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, event: &ExceedanceEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log only
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, event: &ExceedanceEvent) -> Result<(), NotifyError> {
        let parameters: Vec<String> = event
            .exceeded
            .iter()
            .map(|p| format!("{}.{}={}", p.sub_entity, p.parameter, p.value))
            .collect();
        log::warn!(
            "🚨 Exceedance for {} ({}): {}",
            event.entity_id,
            event.company_name,
            parameters.join(", ")
        );
        Ok(())
    }
}

/// Posts events as JSON to an HTTP endpoint
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn dispatch(&self, event: &ExceedanceEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        log::debug!("📨 Exceedance webhook delivered for {}", event.entity_id);
        Ok(())
    }
}

/// Forwards at most one event per entity per UTC day (SMS-style channels)
pub struct ThrottledDispatcher {
    inner: Arc<dyn NotificationDispatcher>,
    last_sent: Mutex<HashMap<String, NaiveDate>>,
}

impl ThrottledDispatcher {
    pub fn new(inner: Arc<dyn NotificationDispatcher>) -> Self {
        Self {
            inner,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the entity's slot for `day`
    ///
    /// Returns `None` when the slot is already used, otherwise the previously
    /// recorded day so a failed send can hand the slot back.
    fn claim(&self, entity_id: &str, day: NaiveDate) -> Option<Option<NaiveDate>> {
        let mut last_sent = self.last_sent.lock().ok()?;
        if last_sent.get(entity_id) == Some(&day) {
            return None;
        }
        Some(last_sent.insert(entity_id.to_string(), day))
    }

    fn release(&self, entity_id: &str, day: NaiveDate, previous: Option<NaiveDate>) {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return;
        };
        if last_sent.get(entity_id) != Some(&day) {
            return;
        }
        match previous {
            Some(previous) => {
                last_sent.insert(entity_id.to_string(), previous);
            }
            None => {
                last_sent.remove(entity_id);
            }
        }
    }
}

#[async_trait]
impl NotificationDispatcher for ThrottledDispatcher {
    async fn dispatch(&self, event: &ExceedanceEvent) -> Result<(), NotifyError> {
        let day = event.timestamp.date_naive();
        let Some(previous) = self.claim(&event.entity_id, day) else {
            log::debug!("🔕 Throttled exceedance notification for {}", event.entity_id);
            return Ok(());
        };

        let result = self.inner.dispatch(event).await;
        if result.is_err() {
            self.release(&event.entity_id, day, previous);
        }
        result
    }
}

/// Sends every event to each dispatcher; one failing channel does not stop the others
pub struct FanoutDispatcher {
    targets: Vec<Arc<dyn NotificationDispatcher>>,
}

impl FanoutDispatcher {
    pub fn new(targets: Vec<Arc<dyn NotificationDispatcher>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl NotificationDispatcher for FanoutDispatcher {
    async fn dispatch(&self, event: &ExceedanceEvent) -> Result<(), NotifyError> {
        let mut first_error = None;
        for target in &self.targets {
            if let Err(e) = target.dispatch(event).await {
                log::warn!("⚠️  Notification channel failed for {}: {}", event.entity_id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingDispatcher {
        sent: AtomicUsize,
        fail: AtomicBool,
    }

    fn make_counter(fail: bool) -> Arc<CountingDispatcher> {
        Arc::new(CountingDispatcher {
            sent: AtomicUsize::new(0),
            fail: AtomicBool::new(fail),
        })
    }

    #[async_trait]
    impl NotificationDispatcher for CountingDispatcher {
        async fn dispatch(&self, _event: &ExceedanceEvent) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(NotifyError::Rejected(503));
            }
            Ok(())
        }
    }

    fn make_event(entity: &str, ts: &str) -> ExceedanceEvent {
        ExceedanceEvent {
            entity_id: entity.to_string(),
            product_id: "P1".to_string(),
            company_name: "Acme".to_string(),
            category: None,
            contact: Contact::default(),
            exceeded: Vec::new(),
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn test_throttle_once_per_entity_per_day() {
        let counter = make_counter(false);
        let throttled = ThrottledDispatcher::new(counter.clone());

        throttled.dispatch(&make_event("U1", "2024-03-14T08:00:00Z")).await.unwrap();
        throttled.dispatch(&make_event("U1", "2024-03-14T21:00:00Z")).await.unwrap();
        throttled.dispatch(&make_event("U2", "2024-03-14T21:00:00Z")).await.unwrap();
        throttled.dispatch(&make_event("U1", "2024-03-15T00:10:00Z")).await.unwrap();

        assert_eq!(counter.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_the_daily_slot_open() {
        let counter = make_counter(true);
        let throttled = ThrottledDispatcher::new(counter.clone());

        let first = throttled.dispatch(&make_event("U1", "2024-03-14T08:00:00Z")).await;
        assert!(matches!(first, Err(NotifyError::Rejected(503))));

        counter.fail.store(false, Ordering::SeqCst);
        throttled.dispatch(&make_event("U1", "2024-03-14T09:00:00Z")).await.unwrap();
        throttled.dispatch(&make_event("U1", "2024-03-14T10:00:00Z")).await.unwrap();
        assert_eq!(counter.sent.load(Ordering::SeqCst), 2);

        // A failure on a later day restores the earlier day, not an empty slot
        counter.fail.store(true, Ordering::SeqCst);
        assert!(throttled.dispatch(&make_event("U1", "2024-03-15T08:00:00Z")).await.is_err());
        counter.fail.store(false, Ordering::SeqCst);
        throttled.dispatch(&make_event("U1", "2024-03-14T11:00:00Z")).await.unwrap();
        assert_eq!(counter.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fanout_continues_past_failures() {
        let failing = make_counter(true);
        let healthy = make_counter(false);
        let fanout = FanoutDispatcher::new(vec![failing.clone(), healthy.clone()]);

        let result = fanout.dispatch(&make_event("U1", "2024-03-14T08:00:00Z")).await;
        assert!(matches!(result, Err(NotifyError::Rejected(503))));
        assert_eq!(healthy.sent.load(Ordering::SeqCst), 1);
    }
}
