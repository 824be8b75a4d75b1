use crate::diagnostic::ErrorEnvelope;
use crate::types::{InvocationOutcome, LambdaEvent};
use bytes::Bytes;
use lambda_control_client::body::Body;
use pin_project::pin_project;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::oneshot;
use tower::Service;

/// Byte-in/byte-out seam between the runtime loop and user handlers.
///
/// Implemented by the built-in adapters ([`BytesAdapter`],
/// [`JsonAdapter`](crate::JsonAdapter),
/// [`StreamingAdapter`](crate::StreamingAdapter) and
/// [`BackgroundAdapter`](crate::BackgroundAdapter)). The loop
/// guarantees at most one invocation is in flight, so `invoke` is never
/// re-entered; the underlying service must be ready when it is called,
/// which services built with [`service_fn`](tower::service_fn) always are.
pub trait InvocationHandler: Send + 'static {
    /// Future resolving with the invocation's reported outcome. It resolves
    /// only when all handler work has finished, including background work
    /// that outlives the response.
    type Future: Future<Output = InvocationOutcome> + Send + 'static;

    /// Start one invocation.
    fn invoke(&mut self, event: LambdaEvent<Bytes>, channel: ResponseChannel) -> Self::Future;
}

/// Payload an adapter hands to the loop when it emits the response before
/// the handler future completes.
#[derive(Debug)]
pub(crate) enum EarlyResponse {
    /// A complete buffered response to post right away.
    Buffered(Bytes),
    /// Open a streaming post carrying this body. `prelude` tells the codec
    /// whether the body leads with a metadata prelude.
    Streaming { prelude: bool, body: Body },
}

/// Per-invocation channel through which an adapter may flush the response
/// while its handler keeps executing. Buffered adapters drop it unused.
#[derive(Debug)]
pub struct ResponseChannel {
    tx: Option<oneshot::Sender<EarlyResponse>>,
}

impl ResponseChannel {
    pub(crate) fn new() -> (Self, oneshot::Receiver<EarlyResponse>) {
        let (tx, rx) = oneshot::channel();
        (ResponseChannel { tx: Some(tx) }, rx)
    }

    /// Hand the response to the loop. Errors when the response has already
    /// been emitted for this invocation.
    pub(crate) fn start(&mut self, early: EarlyResponse) -> Result<(), crate::Error> {
        let tx = self
            .tx
            .take()
            .ok_or("the response for this invocation has already been emitted")?;
        tx.send(early)
            .map_err(|_| crate::Error::from("the runtime loop is gone"))
    }
}

/// Adapter for byte-in/byte-out services: the handler receives the raw
/// event payload and responds with raw bytes.
pub struct BytesAdapter<S> {
    service: S,
}

impl<S> BytesAdapter<S> {
    /// Wrap a byte-level service.
    pub fn new(service: S) -> Self {
        BytesAdapter { service }
    }
}

impl<S, R> InvocationHandler for BytesAdapter<S>
where
    S: Service<LambdaEvent<Bytes>, Response = R> + Send + 'static,
    S::Error: Display,
    S::Future: Send + 'static,
    R: Into<Bytes>,
{
    type Future = BytesFuture<S::Future>;

    fn invoke(&mut self, event: LambdaEvent<Bytes>, _channel: ResponseChannel) -> Self::Future {
        BytesFuture { inner: self.service.call(event) }
    }
}

/// Future returned by [`BytesAdapter`].
#[pin_project]
pub struct BytesFuture<F> {
    #[pin]
    inner: F,
}

impl<F, R, E> Future for BytesFuture<F>
where
    F: Future<Output = Result<R, E>>,
    R: Into<Bytes>,
    E: Display,
{
    type Output = InvocationOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match ready!(self.project().inner.poll(cx)) {
            Ok(response) => InvocationOutcome::Response(response.into()),
            Err(err) => InvocationOutcome::Fault(ErrorEnvelope::unhandled(err.to_string())),
        };
        Poll::Ready(outcome)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::InvocationContext;

    fn context() -> InvocationContext {
        InvocationContext {
            request_id: "test-id".into(),
            deadline_ms: 10_000,
            invoked_function_arn: "arn::fn".into(),
            trace_id: "Root=1".into(),
            client_context: None,
            cognito_identity: None,
            invocation_count: 1,
        }
    }

    #[tokio::test]
    async fn bytes_adapter_passes_payload_through() {
        let service = tower::service_fn(|event: LambdaEvent<Bytes>| async move {
            Ok::<_, std::convert::Infallible>(event.payload)
        });
        let mut adapter = BytesAdapter::new(service);
        let (channel, _rx) = ResponseChannel::new();
        let event = LambdaEvent::new(Bytes::from_static(b"ping"), context());
        match adapter.invoke(event, channel).await {
            InvocationOutcome::Response(bytes) => assert_eq!(&bytes[..], b"ping"),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bytes_adapter_reports_handler_errors_as_unhandled() {
        let service = tower::service_fn(|_event: LambdaEvent<Bytes>| async move {
            Err::<Bytes, crate::Error>("E".into())
        });
        let mut adapter = BytesAdapter::new(service);
        let (channel, _rx) = ResponseChannel::new();
        let event = LambdaEvent::new(Bytes::new(), context());
        match adapter.invoke(event, channel).await {
            InvocationOutcome::Fault(envelope) => {
                assert_eq!(envelope.error_type, "Unhandled Error");
                assert_eq!(envelope.error_message, "E");
            }
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[test]
    fn response_channel_is_single_use() {
        let (mut channel, _rx) = ResponseChannel::new();
        assert!(channel.start(EarlyResponse::Buffered(Bytes::new())).is_ok());
        assert!(channel.start(EarlyResponse::Buffered(Bytes::new())).is_err());
    }
}
