//! Background work after the response.
//!
//! A background-task handler flushes its response through an
//! [`OutputWriter`] and keeps executing. The runtime holds the invocation
//! scope open until the handler returns: no `/next` poll is issued while
//! background work is still running.

use crate::deserializer;
use crate::diagnostic::ErrorEnvelope;
use crate::handler::{EarlyResponse, InvocationHandler, ResponseChannel};
use crate::types::{InvocationContext, InvocationOutcome, LambdaEvent};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::Service;
use tracing::error;

/// Event handed to background-task handlers.
pub struct BackgroundEvent<E, O> {
    /// Decoded event payload.
    pub payload: E,
    /// Invocation context.
    pub context: InvocationContext,
    /// Writer that posts the response while the handler keeps running.
    pub writer: OutputWriter<O>,
}

/// Writer through which a background-task handler flushes its response.
///
/// `write` consumes the writer: a handler's output is posted at most once
/// per invocation, enforced at compile time.
pub struct OutputWriter<O> {
    channel: ResponseChannel,
    reported: Arc<AtomicBool>,
    _output: PhantomData<fn(O)>,
}

impl<O: Serialize> OutputWriter<O> {
    fn new(channel: ResponseChannel) -> (Self, Arc<AtomicBool>) {
        let reported = Arc::new(AtomicBool::new(false));
        (
            OutputWriter {
                channel,
                reported: reported.clone(),
                _output: PhantomData,
            },
            reported,
        )
    }

    /// Serialize the output and flush it to the control plane immediately.
    /// Code after this call runs as background work; it finishes before the
    /// invocation is acknowledged and the next event is fetched.
    pub fn write(mut self, output: O) -> Result<(), crate::Error> {
        let body = serde_json::to_vec(&output)?;
        self.channel.start(EarlyResponse::Buffered(body.into()))?;
        self.reported.store(true, Ordering::Release);
        Ok(())
    }
}

/// Adapter for handlers that respond early and continue with background
/// work.
pub struct BackgroundAdapter<S, E, O> {
    service: S,
    _phantom: PhantomData<fn(E) -> O>,
}

impl<S, E, O> BackgroundAdapter<S, E, O> {
    /// Wrap a background-task service.
    pub fn new(service: S) -> Self {
        BackgroundAdapter {
            service,
            _phantom: PhantomData,
        }
    }
}

impl<S, E, O> InvocationHandler for BackgroundAdapter<S, E, O>
where
    S: Service<BackgroundEvent<E, O>, Response = ()> + Send + 'static,
    S::Error: Display,
    S::Future: Send + 'static,
    E: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Future = BoxFuture<'static, InvocationOutcome>;

    fn invoke(&mut self, event: LambdaEvent<Bytes>, channel: ResponseChannel) -> Self::Future {
        let (payload, context) = event.into_parts();
        let event = match deserializer::deserialize::<E>(&payload, context) {
            Ok(event) => event,
            Err(err) => {
                let fault = InvocationOutcome::Fault(ErrorEnvelope::unhandled(err.to_string()));
                return futures::future::ready(fault).boxed();
            }
        };
        let (payload, context) = event.into_parts();
        let (writer, reported) = OutputWriter::new(channel);
        let fut = self.service.call(BackgroundEvent {
            payload,
            context,
            writer,
        });
        async move {
            match fut.await {
                Ok(()) if reported.load(Ordering::Acquire) => InvocationOutcome::Streamed,
                // The handler never wrote; post an empty response.
                Ok(()) => InvocationOutcome::Response(Bytes::new()),
                Err(err) if reported.load(Ordering::Acquire) => {
                    // The response is already committed; there is nothing
                    // left to report for this invocation.
                    error!(error = %err, "background work failed after the response was flushed");
                    InvocationOutcome::Streamed
                }
                Err(err) => InvocationOutcome::Fault(ErrorEnvelope::unhandled(err.to_string())),
            }
        }
        .boxed()
    }
}
