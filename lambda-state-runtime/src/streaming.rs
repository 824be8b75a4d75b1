//! Streamed invocation responses.
//!
//! A streaming handler receives a [`ResponseWriter`] and emits the response
//! body fragment by fragment while it runs. The first write opens the
//! `/response` post; every later `write` suspends until the connection has
//! flushed the previous fragment.

use crate::diagnostic::ErrorEnvelope;
use crate::handler::{EarlyResponse, InvocationHandler, ResponseChannel};
use crate::types::{InvocationContext, InvocationOutcome, LambdaEvent, MetadataPrelude};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use lambda_control_client::body::{AbortHandle, Body, Sender};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::Service;
use tracing::error;

/// Event handed to streaming handlers.
pub struct StreamingEvent {
    /// Raw event payload.
    pub payload: Bytes,
    /// Invocation context.
    pub context: InvocationContext,
    /// Writer for the streamed response.
    pub writer: ResponseWriter,
}

/// Incremental writer for one streamed response.
///
/// An optional [`write_status_and_headers`](ResponseWriter::write_status_and_headers)
/// call must come before the first [`write`](ResponseWriter::write); the
/// prelude and its NUL separator are emitted as one fragment ahead of any
/// body bytes. Dropping the writer, or calling
/// [`finish`](ResponseWriter::finish), completes the response body.
pub struct ResponseWriter {
    channel: ResponseChannel,
    sender: Sender,
    body: Option<Body>,
    prelude: Option<MetadataPrelude>,
    started: Arc<AtomicBool>,
}

impl ResponseWriter {
    pub(crate) fn new(channel: ResponseChannel) -> Self {
        let (sender, body) = Body::channel();
        ResponseWriter {
            channel,
            sender,
            body: Some(body),
            prelude: None,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn started_flag(&self) -> Arc<AtomicBool> {
        self.started.clone()
    }

    pub(crate) fn abort_handle(&self) -> AbortHandle {
        self.sender.abort_handle()
    }

    /// Set the status, headers and cookies of the response. Allowed only
    /// before the first `write`.
    pub fn write_status_and_headers(&mut self, prelude: MetadataPrelude) -> Result<(), crate::Error> {
        if self.started.load(Ordering::Acquire) {
            return Err("status and headers must be written before any response bytes".into());
        }
        self.prelude = Some(prelude);
        Ok(())
    }

    async fn ensure_started(&mut self) -> Result<(), crate::Error> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let body = self
            .body
            .take()
            .ok_or("the response body has already been opened")?;
        let prelude = match &self.prelude {
            Some(prelude) => {
                let mut framed = serde_json::to_vec(prelude)?;
                framed.push(0);
                Some(framed)
            }
            None => None,
        };
        self.channel.start(EarlyResponse::Streaming {
            prelude: prelude.is_some(),
            body,
        })?;
        self.started.store(true, Ordering::Release);
        if let Some(framed) = prelude {
            // One fragment: the prelude cannot interleave with body bytes.
            self.sender.send_data(framed.into()).await?;
        }
        Ok(())
    }

    /// Write one response fragment. Suspends until the connection has
    /// accepted the fragment.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), crate::Error> {
        self.ensure_started().await?;
        self.sender.send_data(data.into()).await?;
        Ok(())
    }

    /// Complete the response. A writer that is dropped instead completes
    /// the response the same way.
    pub async fn finish(mut self) -> Result<(), crate::Error> {
        self.ensure_started().await?;
        Ok(())
    }
}

/// Adapter for handlers that stream their response.
pub struct StreamingAdapter<S> {
    service: S,
}

impl<S> StreamingAdapter<S> {
    /// Wrap a streaming service.
    pub fn new(service: S) -> Self {
        StreamingAdapter { service }
    }
}

impl<S> InvocationHandler for StreamingAdapter<S>
where
    S: Service<StreamingEvent, Response = ()> + Send + 'static,
    S::Error: Display,
    S::Future: Send + 'static,
{
    type Future = BoxFuture<'static, InvocationOutcome>;

    fn invoke(&mut self, event: LambdaEvent<Bytes>, channel: ResponseChannel) -> Self::Future {
        let (payload, context) = event.into_parts();
        let writer = ResponseWriter::new(channel);
        let started = writer.started_flag();
        let mut abort = writer.abort_handle();
        let fut = self.service.call(StreamingEvent {
            payload,
            context,
            writer,
        });
        async move {
            match fut.await {
                Ok(()) if started.load(Ordering::Acquire) => InvocationOutcome::Streamed,
                // Nothing was written; report an empty buffered response.
                Ok(()) => InvocationOutcome::Response(Bytes::new()),
                Err(err) if started.load(Ordering::Acquire) => {
                    // The response has already started; an error envelope
                    // can no longer be posted for this invocation. Tear the
                    // body down so the control plane does not mistake the
                    // truncated stream for a complete response.
                    error!(error = %err, "handler failed after the response stream started");
                    abort.abort();
                    InvocationOutcome::Streamed
                }
                Err(err) => InvocationOutcome::Fault(ErrorEnvelope::unhandled(err.to_string())),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prelude_must_precede_writes() {
        let (channel, _rx) = ResponseChannel::new();
        let mut writer = ResponseWriter::new(channel);
        writer.started.store(true, Ordering::Release);
        assert!(writer.write_status_and_headers(MetadataPrelude::default()).is_err());
    }

    #[tokio::test]
    async fn first_write_opens_the_response_with_prelude_flag() {
        let (channel, mut rx) = ResponseChannel::new();
        let mut writer = ResponseWriter::new(channel);
        writer
            .write_status_and_headers(MetadataPrelude::default())
            .unwrap();

        let write = tokio::spawn(async move {
            writer.write("a").await.unwrap();
            writer.finish().await.unwrap();
        });

        match (&mut rx).await.unwrap() {
            EarlyResponse::Streaming { prelude, body } => {
                assert!(prelude);
                // Drain the channel body so the writer can finish: prelude
                // frame first, then the fragment.
                use http_body_util::BodyExt;
                let collected = body.collect().await.unwrap().to_bytes();
                let nul = collected.iter().position(|b| *b == 0).expect("missing NUL");
                let prelude: serde_json::Value = serde_json::from_slice(&collected[..nul]).unwrap();
                assert_eq!(prelude["statusCode"], 200);
                assert_eq!(&collected[nul + 1..], b"a");
            }
            other => panic!("expected a streaming response, got {other:?}"),
        }
        write.await.unwrap();
    }
}
