use crate::deserializer;
use crate::diagnostic::ErrorEnvelope;
use crate::handler::{InvocationHandler, ResponseChannel};
use crate::types::{InvocationOutcome, LambdaEvent};
use bytes::Bytes;
use pin_project::pin_project;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tower::Service;

/// Adapter for JSON-in/JSON-out services: the event payload is
/// deserialized into `E` before the handler runs, and the handler's `O` is
/// serialized into the response body.
///
/// A payload that does not deserialize, and an output that does not
/// serialize, are invocation errors, not initialization errors: the
/// envelope is posted to the invocation's `/error` endpoint and the
/// runtime keeps serving.
pub struct JsonAdapter<S, E, O> {
    service: S,
    _phantom: PhantomData<fn(E) -> O>,
}

impl<S, E, O> JsonAdapter<S, E, O> {
    /// Wrap a JSON-codable service.
    pub fn new(service: S) -> Self {
        JsonAdapter {
            service,
            _phantom: PhantomData,
        }
    }
}

impl<S, E, O> InvocationHandler for JsonAdapter<S, E, O>
where
    S: Service<LambdaEvent<E>, Response = O> + Send + 'static,
    S::Error: Display,
    S::Future: Send + 'static,
    E: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Future = JsonFuture<S::Future>;

    fn invoke(&mut self, event: LambdaEvent<Bytes>, _channel: ResponseChannel) -> Self::Future {
        let (payload, context) = event.into_parts();
        match deserializer::deserialize::<E>(&payload, context) {
            Ok(event) => JsonFuture::Future(self.service.call(event)),
            Err(err) => JsonFuture::Ready(Some(InvocationOutcome::Fault(ErrorEnvelope::unhandled(
                err.to_string(),
            )))),
        }
    }
}

/// Future returned by [`JsonAdapter`].
#[pin_project(project = JsonFutureProj)]
pub enum JsonFuture<F> {
    /// The handler is running.
    Future(#[pin] F),
    /// The event payload did not decode; the outcome is already known.
    Ready(Option<InvocationOutcome>),
}

impl<F, O, E> Future for JsonFuture<F>
where
    F: Future<Output = Result<O, E>>,
    O: Serialize,
    E: Display,
{
    type Output = InvocationOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match self.project() {
            JsonFutureProj::Future(fut) => match ready!(fut.poll(cx)) {
                Ok(output) => match serde_json::to_vec(&output) {
                    Ok(body) => InvocationOutcome::Response(body.into()),
                    Err(err) => InvocationOutcome::Fault(ErrorEnvelope::unhandled(format!(
                        "failed to serialize the handler output: {err}"
                    ))),
                },
                Err(err) => InvocationOutcome::Fault(ErrorEnvelope::unhandled(err.to_string())),
            },
            JsonFutureProj::Ready(outcome) => outcome.take().expect("future polled after completion"),
        };
        Poll::Ready(outcome)
    }
}
