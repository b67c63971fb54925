//! Chat-history reporting
//!
//! Each committed user turn and each completed reply is queued and delivered in order by a
//! background task, with retries. Closing drains the queue within a deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use voice_session_core::{channel, retry_with_backoff, Error, Role, RetryPolicy, Sender};

use crate::providers::{check_status, request_error};

/// One conversation message as reported to the history service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReport {
    pub session_id: String,
    pub agent_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatReport {
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Where reports are delivered
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: &ChatReport) -> Result<(), Error>;
}

/// Posts reports as JSON to an HTTP endpoint
pub struct HttpReportSink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpReportSink {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn deliver(&self, report: &ChatReport) -> Result<(), Error> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(report)
            .send()
            .await
            .map_err(|e| request_error("history", e))?;
        check_status("history", response).await?;
        Ok(())
    }
}

/// Per-session queue with a background delivery task
pub struct HistoryReporter {
    queue: Sender<ChatReport>,
    task: Option<JoinHandle<()>>,
}

impl HistoryReporter {
    pub fn spawn(sink: Arc<dyn ReportSink>, retry: RetryPolicy) -> Self {
        let (queue, mut reports) = channel::<ChatReport>();

        let task = tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let result = retry_with_backoff(&retry, "history_report", || sink.deliver(&report)).await;
                if let Err(e) = result {
                    tracing::error!(
                        session_id = %report.session_id,
                        role = %report.role,
                        "Dropping chat report: {}",
                        e
                    );
                }
            }
        });

        Self {
            queue,
            task: Some(task),
        }
    }

    /// Reporter that discards everything (no history endpoint configured)
    pub fn disabled() -> Self {
        let (queue, _) = channel::<ChatReport>();
        queue.close();
        Self { queue, task: None }
    }

    pub fn report(&self, report: ChatReport) {
        if self.queue.send(report).is_err() && self.task.is_some() {
            tracing::debug!("History queue closed, report dropped");
        }
    }

    /// Stop accepting reports and wait for queued ones, up to `deadline`. Idempotent.
    pub async fn close(&mut self, deadline: Duration) {
        self.queue.close();
        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("History task ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "History drain timed out, abandoning queued reports"
                );
                task.abort();
            }
        }
    }
}

impl Drop for HistoryReporter {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use voice_session_core::ProviderError;

    #[derive(Default)]
    struct Collect {
        delivered: Mutex<Vec<String>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ReportSink for Collect {
        async fn deliver(&self, report: &ChatReport) -> Result<(), Error> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::transient("history", "503").into());
            }
            self.delivered.lock().push(report.content.clone());
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl ReportSink for Stuck {
        async fn deliver(&self, _report: &ChatReport) -> Result<(), Error> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_in_order_with_retries() {
        let sink = Arc::new(Collect {
            failures_left: AtomicU32::new(1),
            ..Collect::default()
        });
        let mut reporter = HistoryReporter::spawn(sink.clone(), RetryPolicy::default());

        reporter.report(ChatReport::new("s1", "a1", Role::User, "hello"));
        reporter.report(ChatReport::new("s1", "a1", Role::Assistant, "hi there"));
        reporter.close(Duration::from_secs(2)).await;

        assert_eq!(*sink.delivered.lock(), vec!["hello", "hi there"]);

        // Second close is a no-op; later reports are dropped
        reporter.report(ChatReport::new("s1", "a1", Role::User, "late"));
        reporter.close(Duration::from_secs(2)).await;
        assert_eq!(sink.delivered.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_respects_deadline() {
        let mut reporter = HistoryReporter::spawn(Arc::new(Stuck), RetryPolicy::none());
        reporter.report(ChatReport::new("s1", "a1", Role::User, "hello"));

        let start = tokio::time::Instant::now();
        reporter.close(Duration::from_millis(500)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn test_report_serialization() {
        let report = ChatReport::new("s1", "a1", Role::Assistant, "hi");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["session_id"], "s1");
        assert!(json["timestamp"].is_string());
    }
}
