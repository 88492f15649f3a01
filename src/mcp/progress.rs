//! Progress notifications for long-running operations.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::TransportError;
use crate::mcp::{method::notifications, rpc::Notification};
use crate::transport::PeerSender;

/// Added to the last reported value when a caller reports a value that does not
/// move forward.
pub const PROGRESS_EPSILON: f64 = 0.001;

/// Opaque, client-chosen handle tying progress updates to one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Integer(i64),
    String(String),
}

impl ProgressToken {
    /// Reads `params._meta.progressToken` from a request payload.
    pub fn from_params(params: Option<&Value>) -> Option<Self> {
        let token = params?.get("_meta")?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressParams<'a> {
    progress_token: &'a ProgressToken,
    progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

struct Inner {
    token: ProgressToken,
    sender: Arc<dyn PeerSender>,
    last: Mutex<Option<f64>>,
}

/// Emits strictly increasing progress for a single operation.
///
/// Built without a token it does nothing, so handlers can report unconditionally.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    inner: Option<Arc<Inner>>,
}

impl ProgressReporter {
    pub fn new(token: Option<ProgressToken>, sender: Arc<dyn PeerSender>) -> Self {
        Self {
            inner: token.map(|token| {
                Arc::new(Inner {
                    token,
                    sender,
                    last: Mutex::new(None),
                })
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<&ProgressToken> {
        self.inner.as_ref().map(|inner| &inner.token)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn report(&self, value: f64, total: Option<f64>) -> Result<(), TransportError> {
        self.emit(value, total, None).await
    }

    pub async fn report_with_message(
        &self,
        value: f64,
        total: Option<f64>,
        message: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.emit(value, total, Some(message.into())).await
    }

    async fn emit(
        &self,
        value: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), TransportError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        // Held across the send so concurrent reports leave in increasing order.
        let mut last = inner.last.lock().await;
        let progress = match *last {
            Some(previous) if value.is_nan() || value <= previous => {
                debug!(
                    progress_token = %inner.token,
                    reported = value,
                    previous,
                    "coercing non-increasing progress"
                );
                // At large magnitudes the epsilon is below one ulp.
                (previous + PROGRESS_EPSILON).max(previous.next_up())
            }
            None if !value.is_finite() => 0.0,
            _ => value,
        };

        let params = ProgressParams {
            progress_token: &inner.token,
            progress,
            total,
            message,
        };
        let notification = Notification::new(notifications::PROGRESS, Some(serde_json::to_value(params)?));
        inner.sender.send(notification.into()).await?;
        *last = Some(progress);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp::rpc::Message;
    use crate::transport::testing::RecordingSender;

    fn progress_values(sender: &RecordingSender) -> Vec<f64> {
        sender
            .messages()
            .into_iter()
            .map(|message| match message {
                Message::Notification(notification) => {
                    assert_eq!(notification.method, notifications::PROGRESS);
                    notification.params.expect("params")["progress"]
                        .as_f64()
                        .expect("numeric progress")
                }
                other => panic!("unexpected message {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn without_token_nothing_is_sent() {
        let sender = Arc::new(RecordingSender::default());
        let reporter = ProgressReporter::new(None, sender.clone());
        reporter.report(1.0, Some(2.0)).await.expect("report");
        assert!(!reporter.is_enabled());
        assert!(reporter.token().is_none());
        assert!(sender.messages().is_empty());
    }

    #[tokio::test]
    async fn stale_reports_are_coerced_upward() {
        let sender = Arc::new(RecordingSender::default());
        let reporter = ProgressReporter::new(Some(ProgressToken::String("t1".into())), sender.clone());

        reporter.report(10.0, None).await.expect("report");
        reporter.report(5.0, None).await.expect("report");
        reporter.report(20.0, None).await.expect("report");

        let values = progress_values(&sender);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], 10.0);
        assert!(values[1] > 10.0 && values[1] < 20.0);
        assert_eq!(values[2], 20.0);
    }

    #[tokio::test]
    async fn equal_values_still_strictly_increase() {
        let sender = Arc::new(RecordingSender::default());
        let reporter = ProgressReporter::new(Some(ProgressToken::Integer(3)), sender.clone());
        for _ in 0..5 {
            reporter.report(1.0, Some(1.0)).await.expect("report");
        }
        let values = progress_values(&sender);
        assert!(values.windows(2).all(|pair| pair[1] > pair[0]), "{values:?}");
    }

    #[tokio::test]
    async fn large_values_still_strictly_increase() {
        let sender = Arc::new(RecordingSender::default());
        let reporter = ProgressReporter::new(Some(ProgressToken::String("big".into())), sender.clone());

        reporter.report(1e16, None).await.expect("report");
        reporter.report(5.0, None).await.expect("report");
        reporter.report(1e16, None).await.expect("report");

        let values = progress_values(&sender);
        assert_eq!(values[0], 1e16);
        assert!(values.windows(2).all(|pair| pair[1] > pair[0]), "{values:?}");
    }

    #[tokio::test]
    async fn payload_carries_token_total_and_message() {
        let sender = Arc::new(RecordingSender::default());
        let reporter = ProgressReporter::new(Some(ProgressToken::String("abc".into())), sender.clone());
        reporter
            .report_with_message(1.0, Some(4.0), "indexing")
            .await
            .expect("report");

        let messages = sender.messages();
        let Message::Notification(notification) = &messages[0] else {
            panic!("expected notification");
        };
        assert_eq!(
            notification.params,
            Some(json!({"progressToken": "abc", "progress": 1.0, "total": 4.0, "message": "indexing"}))
        );
    }

    #[tokio::test]
    async fn failed_send_is_surfaced_and_not_recorded() {
        let sender = Arc::new(RecordingSender::failing());
        let reporter = ProgressReporter::new(Some(ProgressToken::Integer(1)), sender);
        assert!(reporter.report(1.0, None).await.is_err());
    }

    #[test]
    fn token_is_read_from_request_meta() {
        let params = json!({"name": "x", "_meta": {"progressToken": 42}});
        assert_eq!(ProgressToken::from_params(Some(&params)), Some(ProgressToken::Integer(42)));
        assert_eq!(ProgressToken::from_params(Some(&json!({}))), None);
        assert_eq!(ProgressToken::from_params(None), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_stay_monotonic() {
        let (sender, _rx) = RecordingSender::with_channel();
        let sender = Arc::new(sender);
        let reporter = ProgressReporter::new(Some(ProgressToken::String("c".into())), sender.clone());

        let mut tasks = Vec::new();
        for n in 0..16 {
            let reporter = reporter.clone();
            tasks.push(tokio::spawn(async move {
                reporter.report(f64::from(n % 4), None).await.expect("report");
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        let values = progress_values(&sender);
        assert_eq!(values.len(), 16);
        assert!(values.windows(2).all(|pair| pair[1] > pair[0]), "{values:?}");
    }
}
