//! Request/response over the event bus.
//!
//! A request is an ordinary envelope carrying a fresh correlation id. The
//! reply is an envelope of type `<request type>:response` (or `:error`)
//! carrying the same id. The first reply wins; later ones are discarded.
//!
//! Waiters are registered before the request is published, so a responder
//! that answers synchronously inside `publish` is still observed.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::bus::{EventBus, PublishReceipt, SubscriptionHandle};
use crate::envelope::{Envelope, EnvelopeDraft};
use crate::events;
use crate::types::{CorrelationId, Error, RequestConfig, Result};

type Reply = Result<Arc<Envelope>>;
type Waiters = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Reply>>>>;

/// Correlation-id based ask/reply built on [`EventBus`].
#[derive(Debug, Clone)]
pub struct RequestBroker {
    bus: EventBus,
    config: RequestConfig,
    waiters: Waiters,
}

impl RequestBroker {
    pub fn new(bus: EventBus, config: RequestConfig) -> Self {
        Self {
            bus,
            config,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish `draft` as a request and return a handle resolving with the
    /// first reply. `timeout_ms == 0` uses the configured default; larger
    /// values are capped at the configured maximum.
    pub fn request(&self, draft: EnvelopeDraft, timeout_ms: u64) -> Result<PendingRequest> {
        let request_type = draft.event_type().to_string();
        crate::envelope::validate_event_type(&request_type)?;

        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(correlation_id.clone(), tx);

        let mut pending = PendingRequest {
            correlation_id: correlation_id.clone(),
            request_type: request_type.clone(),
            timeout: self.effective_timeout(timeout_ms),
            rx: Some(rx),
            waiters: self.waiters.clone(),
            subscriptions: Vec::with_capacity(2),
        };

        // Dropping `pending` on any error below releases the waiter.
        pending.subscriptions.push(self.bus.subscribe(
            format!("request:{}", correlation_id),
            &events::response_type(&request_type),
            Self::reply_handler(self.waiters.clone(), correlation_id.clone(), false),
        )?);
        pending.subscriptions.push(self.bus.subscribe(
            format!("request:{}", correlation_id),
            &events::error_type(&request_type),
            Self::reply_handler(self.waiters.clone(), correlation_id.clone(), true),
        )?);

        self.bus
            .publish(draft.with_correlation_id(correlation_id.clone()))?;

        tracing::debug!(
            request_type = %request_type,
            correlation_id = %correlation_id,
            timeout_ms = pending.timeout.as_millis() as u64,
            "request_sent"
        );
        Ok(pending)
    }

    /// Send a request and await its reply.
    pub async fn ask(&self, draft: EnvelopeDraft, timeout_ms: u64) -> Result<Arc<Envelope>> {
        self.request(draft, timeout_ms)?.wait().await
    }

    /// Publish a reply to `request` carrying its correlation id.
    pub fn respond(
        &self,
        request: &Envelope,
        source_id: &str,
        payload: Value,
    ) -> Result<PublishReceipt> {
        let correlation_id = request.correlation_id().cloned().ok_or_else(|| {
            Error::validation(format!(
                "'{}' has no correlation id to respond to",
                request.event_type()
            ))
        })?;
        self.bus.publish(
            Envelope::draft(events::response_type(request.event_type()), source_id)
                .with_payload(payload)
                .with_correlation_id(correlation_id),
        )
    }

    /// Publish an error reply to `request`.
    pub fn respond_error(
        &self,
        request: &Envelope,
        source_id: &str,
        error: &Error,
    ) -> Result<PublishReceipt> {
        let correlation_id = request.correlation_id().cloned().ok_or_else(|| {
            Error::validation(format!(
                "'{}' has no correlation id to respond to",
                request.event_type()
            ))
        })?;
        self.bus.publish(
            Envelope::draft(events::error_type(request.event_type()), source_id)
                .with_label(events::ERROR_LABEL)
                .with_payload(serde_json::json!({
                    "code": error.code(),
                    "message": error.to_string(),
                }))
                .with_correlation_id(correlation_id),
        )
    }

    /// Answer every `request_type` request with `handler`'s result.
    ///
    /// A handler error is sent back as `<request_type>:error`.
    pub fn serve<F>(
        &self,
        source_id: impl Into<String>,
        request_type: &str,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Envelope) -> Result<Value> + Send + Sync + 'static,
    {
        crate::envelope::validate_event_type(request_type)?;
        let source_id = source_id.into();
        let broker = self.clone();
        let responder = source_id.clone();
        self.bus.subscribe(source_id, request_type, move |request| {
            if request.correlation_id().is_none() {
                return Ok(());
            }
            match handler(request) {
                Ok(payload) => broker.respond(request, &responder, payload).map(|_| ()),
                Err(err) => broker
                    .respond_error(request, &responder, &err)
                    .map(|_| ()),
            }
        })
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn effective_timeout(&self, timeout_ms: u64) -> Duration {
        let ms = if timeout_ms == 0 {
            self.config.default_timeout_ms
        } else {
            timeout_ms.min(self.config.max_timeout_ms)
        };
        Duration::from_millis(ms)
    }

    fn reply_handler(
        waiters: Waiters,
        correlation_id: CorrelationId,
        is_error: bool,
    ) -> impl Fn(&Envelope) -> Result<()> + Send + Sync + 'static {
        move |reply| {
            if reply.correlation_id() != Some(&correlation_id) {
                return Ok(());
            }
            let Some(tx) = waiters.lock().remove(&correlation_id) else {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    event_type = %reply.event_type(),
                    "late_reply_discarded"
                );
                return Ok(());
            };
            let outcome = if is_error {
                let message = reply
                    .payload()
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("responder failed")
                    .to_string();
                Err(Error::RequestFailed(message))
            } else {
                Ok(Arc::new(reply.clone()))
            };
            // Receiver gone means the caller stopped waiting.
            let _ = tx.send(outcome);
            Ok(())
        }
    }
}

/// Handle for an in-flight request.
///
/// Dropping it (or calling [`cancel`](Self::cancel)) removes the waiter and
/// its reply subscriptions.
#[derive(Debug)]
pub struct PendingRequest {
    correlation_id: CorrelationId,
    request_type: String,
    timeout: Duration,
    rx: Option<oneshot::Receiver<Reply>>,
    waiters: Waiters,
    subscriptions: Vec<SubscriptionHandle>,
}

impl PendingRequest {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the first reply, or fail with [`Error::Timeout`].
    pub async fn wait(mut self) -> Result<Arc<Envelope>> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::internal("request already awaited"))?;
        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.release();

        match outcome {
            Err(_) => Err(Error::timeout(format!(
                "no reply to '{}' ({}) within {}ms",
                self.request_type,
                self.correlation_id,
                self.timeout.as_millis()
            ))),
            Ok(Err(_)) => Err(Error::cancelled(format!(
                "request '{}' ({}) was abandoned",
                self.request_type, self.correlation_id
            ))),
            Ok(Ok(reply)) => reply,
        }
    }

    /// Stop waiting. A late reply is discarded.
    pub fn cancel(mut self) {
        tracing::debug!(correlation_id = %self.correlation_id, "request_cancelled");
        self.release();
    }

    fn release(&mut self) {
        self.waiters.lock().remove(&self.correlation_id);
        for handle in self.subscriptions.drain(..) {
            handle.unsubscribe();
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HistoryQuery;
    use std::time::Instant;
    use tracing_test::traced_test;

    fn broker() -> (EventBus, RequestBroker) {
        let bus = EventBus::default();
        let broker = RequestBroker::new(bus.clone(), RequestConfig::default());
        (bus, broker)
    }

    #[tokio::test]
    async fn test_request_resolves_with_first_reply() {
        let (_bus, broker) = broker();
        broker
            .serve("pong-1", "ping", |_| Ok(serde_json::json!({"from": "first"})))
            .unwrap();
        broker
            .serve("pong-2", "ping", |_| Ok(serde_json::json!({"from": "second"})))
            .unwrap();

        let reply = broker
            .ask(Envelope::draft("ping", "tester"), 1_000)
            .await
            .unwrap();
        assert_eq!(reply.payload()["from"], "first");
        assert_eq!(reply.event_type(), "ping:response");
        assert_eq!(broker.pending_count(), 0);
    }

    #[traced_test]
    #[test]
    fn test_second_reply_is_discarded_and_logged() {
        let (_bus, broker) = broker();
        for responder in ["pong-1", "pong-2"] {
            broker
                .serve(responder, "ping", move |_| Ok(serde_json::json!(responder)))
                .unwrap();
        }

        let reply =
            tokio_test::block_on(broker.ask(Envelope::draft("ping", "tester"), 1_000)).unwrap();
        assert_eq!(reply.payload(), &serde_json::json!("pong-1"));
        assert!(logs_contain("late_reply_discarded"));
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        let (bus, broker) = broker();
        let started = Instant::now();
        let err = broker
            .ask(Envelope::draft("ping", "tester"), 50)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(broker.pending_count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_async_responder() {
        let (bus, broker) = broker();
        let responder = broker.clone();
        bus.subscribe("slow", "ping", move |request| {
            let responder = responder.clone();
            let request = request.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = responder.respond(&request, "slow", serde_json::json!("late pong"));
            });
            Ok(())
        })
        .unwrap();

        let reply = broker
            .ask(Envelope::draft("ping", "tester"), 1_000)
            .await
            .unwrap();
        assert_eq!(reply.payload(), &serde_json::json!("late pong"));
    }

    #[tokio::test]
    async fn test_error_reply_fails_request() {
        let (_bus, broker) = broker();
        broker
            .serve("ai", "ai:complete", |_| {
                Err(Error::module_failure("model offline"))
            })
            .unwrap();

        let err = broker
            .ask(Envelope::draft("ai:complete", "ui"), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestFailed(_)));
        assert!(err.to_string().contains("model offline"));
    }

    #[tokio::test]
    async fn test_cancel_removes_waiter_and_discards_late_reply() {
        let (bus, broker) = broker();
        let pending = broker.request(Envelope::draft("ping", "tester"), 1_000).unwrap();
        assert_eq!(broker.pending_count(), 1);

        let request = bus
            .query(&HistoryQuery::new().type_prefix("ping"))
            .pop()
            .unwrap();
        pending.cancel();
        assert_eq!(broker.pending_count(), 0);

        let receipt = broker
            .respond(&request, "late", serde_json::json!(null))
            .unwrap();
        assert_eq!(receipt.delivered, 0);
    }

    #[tokio::test]
    async fn test_drop_releases_waiter() {
        let (bus, broker) = broker();
        {
            let _pending = broker.request(Envelope::draft("ping", "tester"), 1_000).unwrap();
            assert_eq!(bus.subscriber_count(), 2);
        }
        assert_eq!(broker.pending_count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_timeout_defaults_and_caps() {
        let (_bus, broker) = broker();
        assert_eq!(broker.effective_timeout(0), Duration::from_millis(5_000));
        assert_eq!(broker.effective_timeout(100), Duration::from_millis(100));
        assert_eq!(
            broker.effective_timeout(u64::MAX),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn test_respond_requires_correlation_id() {
        let (bus, broker) = broker();
        let plain = bus.publish(Envelope::draft("ping", "t")).unwrap().envelope;
        assert!(broker.respond(&plain, "x", Value::Null).is_err());
    }

    #[test]
    fn test_invalid_request_type_leaves_nothing_behind() {
        let (bus, broker) = broker();
        assert!(broker.request(Envelope::draft("", "t"), 10).is_err());
        assert_eq!(broker.pending_count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
