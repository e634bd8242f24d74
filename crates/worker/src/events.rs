//! Per-run client output stream.
//!
//! Events publish to `agent_run:{id}:stream` with approximate maxlen
//! trimming. Delivery is best-effort and lossy under backpressure: a
//! failed publish logs at debug and is dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use fd_broker::Broker;
use fd_domain::errmap::UserFriendlyError;
use fd_domain::events::{Confidence, EstimateBreakdown, OutputEvent, Severity};

const STREAM_MAXLEN: usize = 200;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct EventPublisher {
    broker: Arc<dyn Broker>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish one event. Returns whether it reached the broker.
    pub async fn publish(&self, stream_key: &str, event: &OutputEvent) -> bool {
        if stream_key.is_empty() {
            return false;
        }
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "event serialization failed");
                return false;
            }
        };
        let publish = self
            .broker
            .xadd(stream_key, &payload, STREAM_MAXLEN, true);
        match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(kind = event.kind(), error = %e, "event publish failed");
                false
            }
            Err(_) => {
                tracing::debug!(kind = event.kind(), "event publish timed out");
                false
            }
        }
    }

    // ── Shorthands for the common events ─────────────────────────────

    pub async fn ack(&self, stream_key: &str, agent_run_id: &str) -> bool {
        self.publish(stream_key, &OutputEvent::ack(agent_run_id)).await
    }

    pub async fn thinking(&self, stream_key: &str) -> bool {
        self.publish(stream_key, &OutputEvent::thinking()).await
    }

    pub async fn status(&self, stream_key: &str, status: &str) -> bool {
        self.publish(stream_key, &OutputEvent::status(status)).await
    }

    pub async fn prep_stage(&self, stream_key: &str, stage: &str, detail: Option<String>) -> bool {
        self.publish(
            stream_key,
            &OutputEvent::PrepStage {
                stage: stage.into(),
                detail,
                progress: None,
                timestamp: Utc::now(),
            },
        )
        .await
    }

    pub async fn estimate(
        &self,
        stream_key: &str,
        estimated_seconds: f64,
        confidence: Confidence,
        breakdown: Option<EstimateBreakdown>,
    ) -> bool {
        self.publish(
            stream_key,
            &OutputEvent::Estimate {
                estimated_seconds: (estimated_seconds * 10.0).round() / 10.0,
                confidence,
                breakdown,
                message: format!(
                    "This should take about {} seconds",
                    estimated_seconds as u64
                ),
                timestamp: Utc::now(),
            },
        )
        .await
    }

    pub async fn degradation(
        &self,
        stream_key: &str,
        component: &str,
        message: &str,
        severity: Severity,
    ) -> bool {
        self.publish(
            stream_key,
            &OutputEvent::Degradation {
                component: component.into(),
                message: message.into(),
                severity,
                user_impact: None,
                timestamp: Utc::now(),
            },
        )
        .await
    }

    pub async fn user_error(&self, stream_key: &str, mapped: &UserFriendlyError) -> bool {
        self.publish(
            stream_key,
            &OutputEvent::Error {
                error: mapped.message.clone(),
                error_code: mapped.error_code.as_str().into(),
                recoverable: mapped.recoverable,
                actions: mapped.actions.clone(),
                timestamp: Utc::now(),
            },
        )
        .await
    }

    pub async fn context_usage(
        &self,
        stream_key: &str,
        current_tokens: u64,
        message_count: usize,
        compressed: bool,
    ) -> bool {
        self.publish(
            stream_key,
            &OutputEvent::ContextUsage {
                current_tokens,
                message_count,
                compressed,
                timestamp: Utc::now(),
            },
        )
        .await
    }

    pub async fn summarizing(
        &self,
        stream_key: &str,
        status: &str,
        tokens_before: Option<u64>,
        tokens_after: Option<u64>,
        messages_before: Option<usize>,
        messages_after: Option<usize>,
    ) -> bool {
        self.publish(
            stream_key,
            &OutputEvent::SummarizingContext {
                status: status.into(),
                tokens_before,
                tokens_after,
                messages_before,
                messages_after,
                timestamp: Utc::now(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fd_broker::MemoryBroker;
    use fd_domain::errmap::{ErrorCode, ErrorMapper};

    #[tokio::test]
    async fn events_land_on_the_stream_in_order() {
        let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new());
        let publisher = EventPublisher::new(broker.clone());

        assert!(publisher.ack("agent_run:r1:stream", "r1").await);
        assert!(publisher.thinking("agent_run:r1:stream").await);
        assert!(publisher.status("agent_run:r1:stream", "completed").await);

        let entries = broker.xrange("agent_run:r1:stream").await.unwrap();
        let kinds: Vec<String> = entries
            .iter()
            .map(|e| {
                serde_json::from_str::<serde_json::Value>(&e.payload).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_owned()
            })
            .collect();
        assert_eq!(kinds, vec!["ack", "thinking", "status"]);
    }

    #[tokio::test]
    async fn error_event_carries_catalog_record() {
        let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new());
        let publisher = EventPublisher::new(broker.clone());
        let mapped = ErrorMapper::new().map_code(ErrorCode::CreditExhausted);

        publisher.user_error("agent_run:r1:stream", &mapped).await;

        let entries = broker.xrange("agent_run:r1:stream").await.unwrap();
        let event: serde_json::Value = serde_json::from_str(&entries[0].payload).unwrap();
        assert_eq!(event["error_code"], "CREDIT_EXHAUSTED");
        assert_eq!(event["recoverable"], false);
        assert_eq!(event["actions"][0]["label"], "Upgrade plan");
    }

    #[tokio::test]
    async fn empty_stream_key_is_dropped() {
        let publisher = EventPublisher::new(Arc::new(MemoryBroker::new()));
        assert!(!publisher.thinking("").await);
    }
}
