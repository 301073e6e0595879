//! Step notifications.
//!
//! A [`NotificationHub`] fans START / SUCCESS / ERROR events of watched
//! processes out to every registered [`Notifier`]. A failing notifier is
//! logged and skipped; it never affects the others or the worker loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};

use crate::error::NotifyError;
use crate::queue::JobKey;

/// Delivery backend for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    async fn notify(
        &self,
        title: &str,
        message: &str,
        context: &Map<String, Value>,
    ) -> Result<(), NotifyError>;
}

/// Step event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyStatus {
    Start,
    Success,
    Error,
}

impl std::fmt::Display for NotifyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Which events of a process are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub on_start: bool,
    pub on_success: bool,
    pub on_error: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            on_start: true,
            on_success: true,
            on_error: true,
        }
    }
}

impl WatchSettings {
    fn wants(&self, status: NotifyStatus) -> bool {
        match status {
            NotifyStatus::Start => self.on_start,
            NotifyStatus::Success => self.on_success,
            NotifyStatus::Error => self.on_error,
        }
    }
}

/// A single step event.
#[derive(Debug, Clone, Copy)]
pub struct StepEvent<'a> {
    pub worker_name: &'a str,
    pub process: &'a str,
    pub status: NotifyStatus,
    pub key: Option<&'a JobKey>,
    pub error_message: Option<&'a str>,
}

impl StepEvent<'_> {
    fn title(&self) -> String {
        format!("Worker {} - {} - {}", self.worker_name, self.process, self.status)
    }

    fn message(&self) -> String {
        match self.status {
            NotifyStatus::Start => format!("Making {}", self.process),
            NotifyStatus::Success => format!("Success making {}", self.process),
            NotifyStatus::Error => {
                let key = self
                    .key
                    .map(|k| Value::Object(k.clone()).to_string())
                    .unwrap_or_default();
                format!(
                    "Error making {key} -> {} - {}",
                    self.process,
                    self.error_message.unwrap_or_default()
                )
            }
        }
    }

    /// Context passed to notifiers. Key fields are flattened in as well.
    fn context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        if let Some(key) = self.key {
            for (k, v) in key {
                context.insert(k.clone(), v.clone());
            }
            context.insert("key".into(), Value::Object(key.clone()));
        }
        context.insert("worker_name".into(), json!(self.worker_name));
        context.insert("process".into(), json!(self.process));
        context.insert("status".into(), json!(self.status.to_string()));
        if let Some(message) = self.error_message {
            context.insert("error_message".into(), json!(message));
        }
        context
    }
}

/// Registered notifiers plus per-process watch settings.
#[derive(Default, Clone)]
pub struct NotificationHub {
    notifiers: Vec<Arc<dyn Notifier>>,
    watched: HashMap<String, WatchSettings>,
}

impl NotificationHub {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            notifiers,
            watched: HashMap::new(),
        }
    }

    pub fn add_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    /// Start (or update) watching a process by its process name.
    pub fn watch(&mut self, process: impl Into<String>, settings: WatchSettings) {
        self.watched.insert(process.into(), settings);
    }

    pub fn unwatch(&mut self, process: &str) {
        self.watched.remove(process);
    }

    pub fn is_watching(&self, process: &str, status: NotifyStatus) -> bool {
        !self.notifiers.is_empty()
            && self
                .watched
                .get(process)
                .is_some_and(|settings| settings.wants(status))
    }

    /// Deliver `event` to every notifier if its process is watched for it.
    pub async fn emit(&self, event: StepEvent<'_>) {
        if !self.is_watching(event.process, event.status) {
            return;
        }

        let title = event.title();
        let message = event.message();
        let context = event.context();

        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&title, &message, &context).await {
                tracing::warn!(
                    notifier = notifier.name(),
                    process = event.process,
                    error = %e,
                    "Notifier failed"
                );
            }
        }
    }
}

// ── Backends ────────────────────────────────────────────────────────

/// Writes notifications to the tracing log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(
        &self,
        title: &str,
        message: &str,
        context: &Map<String, Value>,
    ) -> Result<(), NotifyError> {
        let status = context.get("status").and_then(Value::as_str).unwrap_or("");
        if status == "ERROR" {
            tracing::warn!(title, status, "{message}");
        } else {
            tracing::info!(title, status, "{message}");
        }
        Ok(())
    }
}

/// Posts notifications to a Slack incoming webhook.
pub struct SlackWebhookNotifier {
    webhook_url: SecretString,
    client: reqwest::Client,
}

impl SlackWebhookNotifier {
    pub fn new(webhook_url: SecretString) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Build from `WORKER_SLACK_WEBHOOK_URL`. Returns `None` if unset.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("WORKER_SLACK_WEBHOOK_URL").ok()?;
        if url.trim().is_empty() {
            return None;
        }
        Some(Self::new(SecretString::from(url)))
    }

    fn payload(title: &str, message: &str) -> Value {
        json!({ "text": format!("#{title}\n```{message}```") })
    }
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn notify(
        &self,
        title: &str,
        message: &str,
        _context: &Map<String, Value>,
    ) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&Self::payload(title, message))
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String, Map<String, Value>)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn notify(
            &self,
            title: &str,
            message: &str,
            context: &Map<String, Value>,
        ) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .await
                .push((title.to_string(), message.to_string(), context.clone()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(
            &self,
            _title: &str,
            _message: &str,
            _context: &Map<String, Value>,
        ) -> Result<(), NotifyError> {
            Err(NotifyError::Request("unreachable".into()))
        }
    }

    fn event<'a>(status: NotifyStatus, key: Option<&'a JobKey>) -> StepEvent<'a> {
        StepEvent {
            worker_name: "standard_worker",
            process: "ephys.Clustering",
            status,
            key,
            error_message: (status == NotifyStatus::Error).then_some("ValueError: boom"),
        }
    }

    #[tokio::test]
    async fn unwatched_process_emits_nothing() {
        let rec = Arc::new(Recording::default());
        let hub = NotificationHub::new(vec![rec.clone() as Arc<dyn Notifier>]);
        hub.emit(event(NotifyStatus::Start, None)).await;
        assert!(rec.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn watch_settings_filter_statuses() {
        let rec = Arc::new(Recording::default());
        let mut hub = NotificationHub::new(vec![rec.clone() as Arc<dyn Notifier>]);
        hub.watch(
            "ephys.Clustering",
            WatchSettings {
                on_start: false,
                ..WatchSettings::default()
            },
        );

        hub.emit(event(NotifyStatus::Start, None)).await;
        hub.emit(event(NotifyStatus::Success, None)).await;

        let sent = rec.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Worker standard_worker - ephys.Clustering - SUCCESS");
    }

    #[tokio::test]
    async fn error_context_carries_key_fields() {
        let rec = Arc::new(Recording::default());
        let mut hub = NotificationHub::new(vec![rec.clone() as Arc<dyn Notifier>]);
        hub.watch("ephys.Clustering", WatchSettings::default());

        let key = json!({"subject": "M1", "session": 3}).as_object().cloned().unwrap();
        hub.emit(event(NotifyStatus::Error, Some(&key))).await;

        let sent = rec.sent.lock().await;
        let (_, message, context) = &sent[0];
        assert!(message.starts_with("Error making {"));
        assert!(message.ends_with("-> ephys.Clustering - ValueError: boom"));
        assert_eq!(context["status"], "ERROR");
        assert_eq!(context["subject"], "M1");
        assert_eq!(context["key"]["session"], 3);
        assert_eq!(context["error_message"], "ValueError: boom");
    }

    #[tokio::test]
    async fn failing_notifier_does_not_block_others() {
        let rec = Arc::new(Recording::default());
        let mut hub = NotificationHub::new(vec![Arc::new(Failing) as Arc<dyn Notifier>, rec.clone()]);
        hub.watch("ephys.Clustering", WatchSettings::default());

        hub.emit(event(NotifyStatus::Start, None)).await;
        assert_eq!(rec.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn tracing_notifier_accepts_every_status() {
        let mut hub = NotificationHub::default();
        hub.add_notifier(Arc::new(TracingNotifier));
        hub.watch("ephys.Clustering", WatchSettings::default());
        assert!(hub.is_watching("ephys.Clustering", NotifyStatus::Error));

        let key = json!({"session": 3}).as_object().cloned().unwrap();
        for status in [NotifyStatus::Start, NotifyStatus::Success, NotifyStatus::Error] {
            let ev = event(status, Some(&key));
            TracingNotifier
                .notify(&ev.title(), &ev.message(), &ev.context())
                .await
                .unwrap();
        }

        hub.unwatch("ephys.Clustering");
        assert!(!hub.is_watching("ephys.Clustering", NotifyStatus::Error));
    }

    #[test]
    fn slack_payload_format() {
        let payload = SlackWebhookNotifier::payload("Title", "body");
        assert_eq!(payload["text"], "#Title\n```body```");
    }
}
