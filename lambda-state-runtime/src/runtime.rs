//! The runtime loop.
//!
//! The loop owns the control-plane connection, the state machine and the
//! handler. It translates I/O completions into machine events, executes
//! the machine's actions, and nothing else: every lifecycle decision lives
//! in the state machine.

use crate::background::BackgroundAdapter;
use crate::config::{self, Config, Endpoint};
use crate::diagnostic::ErrorEnvelope;
use crate::handler::{BytesAdapter, EarlyResponse, InvocationHandler, ResponseChannel};
use crate::json::JsonAdapter;
use crate::machine::{Action, Event, StateMachine};
use crate::requests::{
    decode_reply, ControlPlaneReply, DecodeError, InitErrorRequest, IntoRequest,
    InvocationErrorRequest, InvocationResponseRequest, NextEventRequest, StreamingResponseRequest,
};
use crate::signals;
use crate::streaming::StreamingAdapter;
use crate::types::{InvocationContext, InvocationOutcome, LambdaEvent};
use crate::Error;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::StatusCode;
use lambda_control_client as client;
use lambda_control_client::{Closed, Connection, TransportError};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use std::{error, fmt};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::types::Invocation;

/// Why the runtime terminated abnormally.
#[derive(Debug)]
pub enum RuntimeError {
    /// The handler factory failed. The envelope was reported to
    /// `/runtime/init/error` before the runtime exited.
    Init(ErrorEnvelope),
    /// The control-plane connection failed.
    Transport(TransportError),
    /// The control plane sent a reply the runtime could not decode.
    Reply(DecodeError),
    /// The control plane rejected an exchange with the given status.
    Rejected(StatusCode),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Init(envelope) => {
                write!(f, "handler initialization failed: {}", envelope.error_message)
            }
            RuntimeError::Transport(err) => write!(f, "transport failure: {err}"),
            RuntimeError::Reply(err) => write!(f, "invalid control plane reply: {err}"),
            RuntimeError::Rejected(status) => {
                write!(f, "control plane rejected the exchange with status {status}")
            }
        }
    }
}

impl error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            RuntimeError::Transport(err) => Some(err),
            RuntimeError::Reply(err) => Some(err),
            _ => None,
        }
    }
}

type HandlerFactory<H> = Box<dyn FnOnce() -> BoxFuture<'static, Result<H, Error>> + Send>;
type ReplyFuture = BoxFuture<'static, Result<(http::response::Parts, Bytes), TransportError>>;
type HandlerFuture = BoxFuture<'static, InvocationOutcome>;

/// An instance of the Lambda execution loop, bound to one handler.
///
/// The handler is constructed at most once per process, concurrently with
/// the control-plane connection attempt, and lives until the process
/// terminates.
pub struct Runtime<H: InvocationHandler> {
    config: Config,
    factory: HandlerFactory<H>,
}

impl<S, E, O> Runtime<JsonAdapter<S, E, O>>
where
    JsonAdapter<S, E, O>: InvocationHandler,
    S: Send + 'static,
{
    /// Runtime over a JSON-codable service: the event payload deserializes
    /// into the service's request, its response serializes into the
    /// response body.
    pub fn new(handler: S) -> Self {
        let adapter = JsonAdapter::new(handler);
        Runtime {
            config: Config::default(),
            factory: Box::new(move || std::future::ready(Ok(adapter)).boxed()),
        }
    }

    /// Runtime whose handler is built by an asynchronous, fallible factory.
    ///
    /// The factory runs concurrently with the connection attempt, which
    /// shortens cold starts when handler construction does I/O of its own.
    /// A factory error is reported to `/runtime/init/error` and terminates
    /// the runtime with a non-zero exit.
    pub fn from_factory<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, Error>> + Send + 'static,
    {
        Runtime {
            config: Config::default(),
            factory: Box::new(move || factory().map(|result| result.map(JsonAdapter::new)).boxed()),
        }
    }
}

impl<S> Runtime<BytesAdapter<S>>
where
    BytesAdapter<S>: InvocationHandler,
    S: Send + 'static,
{
    /// Runtime over a byte-in/byte-out service.
    pub fn bytes(handler: S) -> Self {
        let adapter = BytesAdapter::new(handler);
        Runtime {
            config: Config::default(),
            factory: Box::new(move || std::future::ready(Ok(adapter)).boxed()),
        }
    }
}

impl<S> Runtime<StreamingAdapter<S>>
where
    StreamingAdapter<S>: InvocationHandler,
    S: Send + 'static,
{
    /// Runtime over a service that streams its response through a
    /// [`ResponseWriter`](crate::ResponseWriter).
    pub fn streaming(handler: S) -> Self {
        let adapter = StreamingAdapter::new(handler);
        Runtime {
            config: Config::default(),
            factory: Box::new(move || std::future::ready(Ok(adapter)).boxed()),
        }
    }
}

impl<S, E, O> Runtime<BackgroundAdapter<S, E, O>>
where
    BackgroundAdapter<S, E, O>: InvocationHandler,
    S: Send + 'static,
{
    /// Runtime over a service that flushes its response through an
    /// [`OutputWriter`](crate::OutputWriter) and continues with background
    /// work.
    pub fn background(handler: S) -> Self {
        let adapter = BackgroundAdapter::new(handler);
        Runtime {
            config: Config::default(),
            factory: Box::new(move || std::future::ready(Ok(adapter)).boxed()),
        }
    }
}

impl<H: InvocationHandler> Runtime<H> {
    /// Replace the default configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Start the runtime and drive it until shutdown.
    ///
    /// Returns `Ok(())` on a clean shutdown (stop signal or bounded
    /// invocation exit) and an error when initialization fails or the
    /// connection is lost. Invocation-level handler errors are reported to
    /// the control plane and do not terminate the runtime.
    pub async fn run(self) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        let _ = lambda_control_client::tracing::try_init_subscriber(self.config.log_level);

        let (close_tx, close_rx) = watch::channel(false);
        signals::listen(&self.config.stop_signals, close_tx.clone());

        let endpoint = match &self.config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => match std::env::var(config::RUNTIME_ENDPOINT_VAR) {
                Ok(value) => Endpoint::parse(&value)?,
                #[cfg(feature = "local")]
                Err(_) => crate::local::start(close_tx.clone()).await?,
                #[cfg(not(feature = "local"))]
                Err(_) => {
                    return Err(format!(
                        "{} is not set and the local server is not enabled",
                        config::RUNTIME_ENDPOINT_VAR
                    )
                    .into())
                }
            },
        };

        let runtime_loop = RuntimeLoop::new(self.config, close_rx);
        runtime_loop.run(self.factory, endpoint).await
    }
}

/// What woke the loop up. Produced by the select in
/// [`RuntimeLoop::next_wakeup`]; processed with full access to the loop
/// state afterwards.
enum Wakeup {
    Handler(InvocationOutcome),
    Early(Option<EarlyResponse>),
    Reply(Result<(http::response::Parts, Bytes), TransportError>),
    Hangup(Option<TransportError>),
    Close,
}

struct RuntimeLoop<H: InvocationHandler> {
    config: Config,
    machine: StateMachine<H>,
    connection: Option<Connection>,
    closed: Option<Closed>,
    inactive_seen: bool,
    close_rx: watch::Receiver<bool>,
    close_delivered: bool,
    /// The one in-flight control-plane exchange, if any.
    pending_send: Option<ReplyFuture>,
    /// The running handler future, if an invocation is in flight.
    pending_handler: Option<HandlerFuture>,
    /// Receives a response emitted before the handler future completes.
    early_rx: Option<oneshot::Receiver<EarlyResponse>>,
    /// Response future of a post opened by an early response; its
    /// acknowledgement is consumed after the handler scope exits.
    parked_response: Option<client::ResponseFuture>,
    current_request_id: Option<String>,
    fatal: Option<RuntimeError>,
}

impl<H: InvocationHandler> RuntimeLoop<H> {
    fn new(config: Config, close_rx: watch::Receiver<bool>) -> Self {
        let machine = StateMachine::new(config.max_invocations);
        RuntimeLoop {
            config,
            machine,
            connection: None,
            closed: None,
            inactive_seen: false,
            close_rx,
            close_delivered: false,
            pending_send: None,
            pending_handler: None,
            early_rx: None,
            parked_response: None,
            current_request_id: None,
            fatal: None,
        }
    }

    async fn run(mut self, factory: HandlerFactory<H>, endpoint: Endpoint) -> Result<(), Error> {
        let connect_action = self.machine.step(Event::Connect);
        debug_assert!(matches!(connect_action, Action::Connect));
        let _ = connect_action;

        // Startup: the connection attempt and the handler factory race;
        // the state machine takes their completions in either order.
        {
            let connect = client::connect(&endpoint.host, endpoint.port);
            tokio::pin!(connect);
            let mut build = factory();
            let mut connect_pending = true;
            let mut build_pending = true;
            while (connect_pending || build_pending) && !self.machine.is_shutdown() {
                let event = tokio::select! {
                    result = &mut connect, if connect_pending => {
                        connect_pending = false;
                        match result {
                            Ok((connection, closed)) => {
                                self.connection = Some(connection);
                                self.closed = Some(closed);
                                Event::Connected
                            }
                            Err(err) => self.transport_failure(err),
                        }
                    }
                    result = &mut build, if build_pending => {
                        build_pending = false;
                        match result {
                            Ok(handler) => Event::HandlerInitialized(handler),
                            Err(err) => {
                                let envelope = ErrorEnvelope::unhandled(err.to_string());
                                self.record_fatal(RuntimeError::Init(envelope.clone()));
                                Event::HandlerFailedToInitialize(envelope)
                            }
                        }
                    }
                };
                let action = self.machine.step(event);
                self.perform(action).await;
            }
        }

        while !self.machine.is_shutdown() {
            if let Some(event) = self.pump_once().await {
                let action = self.machine.step(event);
                self.perform(action).await;
            }
        }

        match self.fatal.take() {
            Some(err) => {
                error!(error = %err, "lambda runtime terminated");
                Err(err.into())
            }
            None => Ok(()),
        }
    }

    /// Wait for the next completion of any pending source.
    async fn next_wakeup(&mut self) -> Wakeup {
        let handler_armed = self.pending_handler.is_some();
        let early_armed = self.early_rx.is_some();
        let send_armed = self.pending_send.is_some();
        let hangup_armed = self.closed.is_some() && !self.inactive_seen;
        let close_armed = !self.close_delivered && self.machine.accepts_close_request();

        let handler = &mut self.pending_handler;
        let early = &mut self.early_rx;
        let send = &mut self.pending_send;
        let closed = &mut self.closed;
        let close_rx = &mut self.close_rx;

        tokio::select! {
            biased;
            outcome = poll_some(handler), if handler_armed => Wakeup::Handler(outcome),
            early_response = poll_some(early), if early_armed => Wakeup::Early(early_response.ok()),
            reply = poll_some(send), if send_armed => Wakeup::Reply(reply),
            hangup = hangup_wait(closed), if hangup_armed => Wakeup::Hangup(hangup),
            _ = close_rx.changed(), if close_armed => Wakeup::Close,
        }
    }

    /// Turn one wakeup into at most one machine event. Early responses are
    /// handled entirely inside the loop and produce no event.
    async fn pump_once(&mut self) -> Option<Event<H>> {
        match self.next_wakeup().await {
            Wakeup::Handler(outcome) => {
                trace!("handler completed");
                self.pending_handler = None;
                // A response writer may have fired in the same poll that
                // completed the handler; drain it before reporting.
                if let Some(mut rx) = self.early_rx.take() {
                    if let Ok(early) = rx.try_recv() {
                        if let Err(err) = self.start_early(early).await {
                            return Some(self.transport_failure(err));
                        }
                    }
                }
                Some(Event::InvocationCompleted(outcome))
            }
            Wakeup::Early(Some(early)) => {
                self.early_rx = None;
                match self.start_early(early).await {
                    Ok(()) => None,
                    Err(err) => Some(self.transport_failure(err)),
                }
            }
            // The adapter dropped the channel without writing; buffered
            // handlers always land here once per invocation.
            Wakeup::Early(None) => {
                self.early_rx = None;
                None
            }
            Wakeup::Reply(reply) => {
                self.pending_send = None;
                match reply {
                    Ok((parts, body)) => match decode_reply(&parts, body) {
                        Ok(ControlPlaneReply::Invocation(invocation)) => {
                            Some(Event::NextReceived(invocation))
                        }
                        Ok(ControlPlaneReply::Accepted) => Some(Event::AcceptedReceived),
                        Ok(ControlPlaneReply::Rejected(_envelope)) => {
                            warn!(status = %parts.status, "control plane rejected the exchange, shutting down");
                            self.record_fatal(RuntimeError::Rejected(parts.status));
                            self.machine.mark_shutdown();
                            if self.machine.awaiting_next_reply() {
                                Some(Event::CloseRequested)
                            } else {
                                Some(Event::AcceptedReceived)
                            }
                        }
                        Err(err) => {
                            self.record_fatal(RuntimeError::Reply(err));
                            Some(Event::TransportError)
                        }
                    },
                    Err(err) => Some(self.transport_failure(err)),
                }
            }
            Wakeup::Hangup(err) => {
                self.inactive_seen = true;
                if let Some(err) = err {
                    debug!(error = %err, "connection driver reported an error");
                }
                if !self.machine.hangup_expected() {
                    self.record_fatal(RuntimeError::Transport(TransportError::ConnectionClosed));
                }
                Some(Event::ChannelInactive)
            }
            Wakeup::Close => {
                self.close_delivered = true;
                info!("shutdown requested");
                Some(Event::CloseRequested)
            }
        }
    }

    /// Execute one action, feeding any follow-up events straight back into
    /// the machine until it has nothing immediate left to do.
    async fn perform(&mut self, mut action: Action) {
        loop {
            let follow = match action {
                Action::Wait => None,
                Action::Connect => unreachable!("the connect action is driven by the startup sequence"),
                Action::FireStartupSuccess => {
                    debug!("lambda runtime started");
                    Some(Event::StartupReported)
                }
                Action::FireStartupFailure(envelope) => {
                    error!(error = %envelope.error_message, "lambda runtime failed to start");
                    Some(Event::StartupFailureReported)
                }
                Action::GetNext => {
                    trace!("waiting for the next event");
                    match self.begin_next().await {
                        Ok(()) => None,
                        Err(err) => Some(self.transport_failure(err)),
                    }
                }
                Action::InvokeHandler { invocation, count } => {
                    self.dispatch(invocation, count);
                    None
                }
                Action::ReportInvocationResult { request_id, outcome } => {
                    match self.report_result(&request_id, outcome).await {
                        Ok(()) => None,
                        Err(err) => Some(self.transport_failure(err)),
                    }
                }
                Action::ReportInitializationError(envelope) => {
                    match self.begin_send(InitErrorRequest { envelope }, None).await {
                        Ok(()) => None,
                        Err(err) => Some(self.transport_failure(err)),
                    }
                }
                Action::CloseConnection => {
                    self.pending_send = None;
                    self.parked_response = None;
                    drop(self.connection.take());
                    None
                }
                Action::FireChannelInactive => {
                    debug!("lambda runtime connection closed");
                    None
                }
            };
            match follow {
                Some(event) => action = self.machine.step(event),
                None => return,
            }
        }
    }

    /// Hand the invocation to the handler and keep its future pending.
    fn dispatch(&mut self, invocation: Invocation, count: u64) {
        let context = InvocationContext::new(&invocation, count);
        let span = context.request_span();
        self.current_request_id = Some(invocation.request_id.clone());
        let (channel, early_rx) = ResponseChannel::new();
        self.early_rx = Some(early_rx);

        let event = LambdaEvent::new(invocation.payload, context);
        let future = self.machine.handler_mut().invoke(event, channel);
        let future = AssertUnwindSafe(future)
            .catch_unwind()
            .map(|result| match result {
                Ok(outcome) => outcome,
                Err(panic) => {
                    error!("handler panicked");
                    InvocationOutcome::Fault(panic_envelope(&panic))
                }
            })
            .instrument(span);
        self.pending_handler = Some(future.boxed());
    }

    async fn begin_next(&mut self) -> Result<(), TransportError> {
        let timeout = self.config.request_timeout;
        self.begin_send(NextEventRequest, timeout).await
    }

    async fn report_result(
        &mut self,
        request_id: &str,
        outcome: InvocationOutcome,
    ) -> Result<(), TransportError> {
        self.current_request_id = None;
        self.early_rx = None;
        match outcome {
            InvocationOutcome::Response(body) => {
                self.begin_send(InvocationResponseRequest { request_id, body }, None)
                    .await
            }
            InvocationOutcome::Fault(envelope) => {
                error!(
                    error = %envelope.error_message,
                    requestId = request_id,
                    "handler failed, reporting the invocation error"
                );
                self.begin_send(InvocationErrorRequest { request_id, envelope }, None)
                    .await
            }
            InvocationOutcome::Streamed => {
                let response = self
                    .parked_response
                    .take()
                    .expect("streamed outcome without an open response post");
                self.pending_send = Some(
                    async move {
                        let response = response.await?;
                        let response = client::aggregate(response).await?;
                        Ok(response.into_parts())
                    }
                    .boxed(),
                );
                Ok(())
            }
        }
    }

    /// Open the response post for a response emitted ahead of handler
    /// completion, parking its acknowledgement.
    async fn start_early(&mut self, early: EarlyResponse) -> Result<(), TransportError> {
        let request_id = self
            .current_request_id
            .clone()
            .expect("early response outside of an invocation");
        let connection = self
            .connection
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
        let req = match early {
            EarlyResponse::Buffered(body) => InvocationResponseRequest {
                request_id: &request_id,
                body,
            }
            .into_req(),
            EarlyResponse::Streaming { prelude, body } => StreamingResponseRequest {
                request_id: &request_id,
                prelude,
                body,
            }
            .into_req(),
        }
        .expect("unable to construct request");
        let response = connection.begin(req).await?;
        self.parked_response = Some(response);
        Ok(())
    }

    /// Dispatch one exchange and buffer its reply as the pending send.
    async fn begin_send(
        &mut self,
        request: impl IntoRequest,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
        let req = request.into_req().expect("unable to construct request");
        let response = connection.begin(req).await?;
        let reply = async move {
            let response = response.await?;
            let response = client::aggregate(response).await?;
            Ok(response.into_parts())
        };
        self.pending_send = Some(match timeout {
            Some(limit) => async move {
                match tokio::time::timeout(limit, reply).await {
                    Ok(reply) => reply,
                    Err(_) => Err(TransportError::Timeout),
                }
            }
            .boxed(),
            None => reply.boxed(),
        });
        Ok(())
    }

    fn transport_failure(&mut self, err: TransportError) -> Event<H> {
        self.record_fatal(RuntimeError::Transport(err));
        Event::TransportError
    }

    /// Keep the first fatal error; later failures are usually fallout.
    fn record_fatal(&mut self, err: RuntimeError) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }
}

async fn poll_some<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn hangup_wait(closed: &mut Option<Closed>) -> Option<TransportError> {
    match closed {
        Some(closed) => closed.wait().await,
        None => std::future::pending().await,
    }
}

fn panic_envelope(panic: &(dyn std::any::Any + Send)) -> ErrorEnvelope {
    let message = if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("Lambda panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("Lambda panicked: {msg}")
    } else {
        "Lambda panicked".to_string()
    };
    ErrorEnvelope::unhandled(message)
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;
    use crate::streaming::StreamingEvent;
    use crate::types::MetadataPrelude;
    use crate::BackgroundEvent;
    use httpmock::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tower::service_fn;

    const REQUEST_ID: &str = "156cb537-e2d4-11e8-9b34-d36013741fb9";
    const DEADLINE: &str = "1542409706888";
    const ARN: &str = "arn:aws:lambda:us-east-2:123456789012:function:custom-runtime";
    const TRACE: &str = "Root=1-5bef4de7-ad49b0e87f6ef6c87fc2e700;Parent=9a9197af755a6419";

    fn mock_next<'a>(server: &'a MockServer, body: &str) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(GET).path("/2018-06-01/runtime/invocation/next");
            then.status(200)
                .header("content-type", "application/json")
                .header("lambda-runtime-aws-request-id", REQUEST_ID)
                .header("lambda-runtime-deadline-ms", DEADLINE)
                .header("lambda-runtime-invoked-function-arn", ARN)
                .header("lambda-runtime-trace-id", TRACE)
                .body(body);
        })
    }

    fn config_for(server: &MockServer, max_invocations: u64) -> Config {
        Config {
            endpoint: Some(Endpoint::parse(&server.base_url()).expect("invalid mock server url")),
            max_invocations,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn two_invocations_then_clean_exit() -> Result<(), Error> {
        let server = MockServer::start();
        let next = mock_next(&server, "\"ping\"");
        let response = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/2018-06-01/runtime/invocation/{REQUEST_ID}/response"))
                .body("\"PING\"");
            then.status(202).body("");
        });

        let handler = service_fn(|event: LambdaEvent<String>| async move {
            Ok::<_, Error>(event.payload.to_uppercase())
        });
        Runtime::new(handler)
            .with_config(config_for(&server, 2))
            .run()
            .await?;

        assert_eq!(next.hits(), 2);
        assert_eq!(response.hits(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn handler_error_posts_the_exact_envelope() -> Result<(), Error> {
        let server = MockServer::start();
        let next = mock_next(&server, "\"ping\"");
        let invocation_error = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/2018-06-01/runtime/invocation/{REQUEST_ID}/error"))
                .header("lambda-runtime-function-error-type", "Unhandled")
                .body(r#"{"errorType":"Unhandled Error","errorMessage":"E"}"#);
            then.status(202).body("");
        });

        let handler =
            service_fn(|_event: LambdaEvent<String>| async move { Err::<String, Error>("E".into()) });
        // Invocation-level errors do not terminate the process.
        Runtime::new(handler)
            .with_config(config_for(&server, 1))
            .run()
            .await?;

        assert_eq!(next.hits(), 1);
        assert_eq!(invocation_error.hits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn init_failure_reports_on_the_init_endpoint_and_exits_nonzero() {
        let server = MockServer::start();
        let next = mock_next(&server, "{}");
        let init_error = server.mock(|when, then| {
            when.method(POST)
                .path("/2018-06-01/runtime/init/error")
                .header("lambda-runtime-function-error-type", "Unhandled")
                .body(r#"{"errorType":"Unhandled Error","errorMessage":"E"}"#);
            then.status(202).body("");
        });

        let runtime = Runtime::from_factory(|| async {
            if true {
                return Err::<_, Error>("E".into());
            }
            Ok(service_fn(|event: LambdaEvent<serde_json::Value>| async move {
                Ok::<_, Error>(event.payload)
            }))
        });
        let result = runtime.with_config(config_for(&server, 0)).run().await;

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("handler initialization failed"));
        assert_eq!(init_error.hits(), 1);
        assert_eq!(next.hits(), 0);
    }

    #[tokio::test]
    async fn undecodable_payload_becomes_an_invocation_error() -> Result<(), Error> {
        #[derive(Deserialize)]
        struct Ping {
            #[allow(dead_code)]
            message: String,
        }
        #[derive(Serialize)]
        struct Pong;

        let server = MockServer::start();
        let _next = mock_next(&server, "not json");
        let invocation_error = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/2018-06-01/runtime/invocation/{REQUEST_ID}/error"))
                .header("lambda-runtime-function-error-type", "Unhandled")
                .body_contains("failed to deserialize the incoming data");
            then.status(202).body("");
        });

        let handler = service_fn(|_event: LambdaEvent<Ping>| async move { Ok::<_, Error>(Pong) });
        Runtime::new(handler)
            .with_config(config_for(&server, 1))
            .run()
            .await?;

        assert_eq!(invocation_error.hits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_required_header_is_a_transport_failure() {
        let server = MockServer::start();
        // No request id header on the next-event reply.
        let next = server.mock(|when, then| {
            when.method(GET).path("/2018-06-01/runtime/invocation/next");
            then.status(200)
                .header("lambda-runtime-deadline-ms", DEADLINE)
                .header("lambda-runtime-invoked-function-arn", ARN)
                .header("lambda-runtime-trace-id", TRACE)
                .body("{}");
        });
        let response = server.mock(|when, then| {
            when.method(POST).path_contains("/response");
            then.status(202).body("");
        });

        let invoked = Arc::new(AtomicBool::new(false));
        let witness = invoked.clone();
        let handler = service_fn(move |event: LambdaEvent<serde_json::Value>| {
            let witness = witness.clone();
            async move {
                witness.store(true, Ordering::SeqCst);
                Ok::<_, Error>(event.payload)
            }
        });
        let result = Runtime::new(handler)
            .with_config(config_for(&server, 0))
            .run()
            .await;

        assert!(result.is_err());
        assert!(!invoked.load(Ordering::SeqCst), "the handler must not run");
        assert_eq!(next.hits(), 1);
        assert_eq!(response.hits(), 0);
    }

    #[tokio::test]
    async fn streamed_response_frames_prelude_and_body() -> Result<(), Error> {
        let prelude = MetadataPrelude {
            status_code: http::StatusCode::OK,
            headers: {
                let mut headers = http::HeaderMap::new();
                headers.insert("content-type", "text/plain".parse().unwrap());
                headers
            },
            cookies: Vec::new(),
        };
        let expected = format!("{}\u{0}ab", serde_json::to_string(&prelude)?);

        let server = MockServer::start();
        let next = mock_next(&server, "\"ping\"");
        let response = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/2018-06-01/runtime/invocation/{REQUEST_ID}/response"))
                .header("lambda-runtime-function-response-mode", "streaming")
                .body(&expected);
            then.status(202).body("");
        });

        let handler = service_fn(move |event: StreamingEvent| {
            let prelude = prelude.clone();
            async move {
                let mut writer = event.writer;
                writer.write_status_and_headers(prelude)?;
                writer.write("a").await?;
                writer.write("b").await?;
                writer.finish().await?;
                Ok::<_, Error>(())
            }
        });
        Runtime::streaming(handler)
            .with_config(config_for(&server, 1))
            .run()
            .await?;

        assert_eq!(next.hits(), 1);
        assert_eq!(response.hits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn background_work_finishes_before_the_runtime_moves_on() -> Result<(), Error> {
        let server = MockServer::start();
        let next = mock_next(&server, r#"{"answer":42}"#);
        let response = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/2018-06-01/runtime/invocation/{REQUEST_ID}/response"))
                .body(r#"{"answer":42}"#);
            then.status(202).body("");
        });

        let finished = Arc::new(AtomicBool::new(false));
        let witness = finished.clone();
        let handler = service_fn(
            move |event: BackgroundEvent<serde_json::Value, serde_json::Value>| {
                let witness = witness.clone();
                async move {
                    event.writer.write(event.payload)?;
                    // Work that outlives the response.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    witness.store(true, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            },
        );
        Runtime::background(handler)
            .with_config(config_for(&server, 1))
            .run()
            .await?;

        assert!(finished.load(Ordering::SeqCst), "background work must complete");
        assert_eq!(next.hits(), 1);
        assert_eq!(response.hits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn bytes_handler_round_trips_the_payload() -> Result<(), Error> {
        let server = MockServer::start();
        let _next = mock_next(&server, "ping");
        let response = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/2018-06-01/runtime/invocation/{REQUEST_ID}/response"))
                .body("ping");
            then.status(202).body("");
        });

        let handler =
            service_fn(|event: LambdaEvent<Bytes>| async move { Ok::<_, Error>(event.payload) });
        Runtime::bytes(handler)
            .with_config(config_for(&server, 1))
            .run()
            .await?;

        assert_eq!(response.hits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn next_poll_timeout_terminates_the_runtime() {
        let server = MockServer::start();
        let _next = server.mock(|when, then| {
            when.method(GET).path("/2018-06-01/runtime/invocation/next");
            then.status(200)
                .header("lambda-runtime-aws-request-id", REQUEST_ID)
                .header("lambda-runtime-deadline-ms", DEADLINE)
                .header("lambda-runtime-invoked-function-arn", ARN)
                .header("lambda-runtime-trace-id", TRACE)
                .delay(Duration::from_millis(500))
                .body("{}");
        });

        let handler = service_fn(|event: LambdaEvent<serde_json::Value>| async move {
            Ok::<_, Error>(event.payload)
        });
        let mut config = config_for(&server, 0);
        config.request_timeout = Some(Duration::from_millis(50));
        let result = Runtime::new(handler).with_config(config).run().await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn control_plane_rejection_shuts_the_runtime_down() {
        let server = MockServer::start();
        let next = server.mock(|when, then| {
            when.method(GET).path("/2018-06-01/runtime/invocation/next");
            then.status(403).body("");
        });

        let handler = service_fn(|event: LambdaEvent<serde_json::Value>| async move {
            Ok::<_, Error>(event.payload)
        });
        let result = Runtime::new(handler)
            .with_config(config_for(&server, 0))
            .run()
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("rejected"));
        assert_eq!(next.hits(), 1);
    }

    #[tokio::test]
    async fn handler_panic_becomes_an_invocation_error() -> Result<(), Error> {
        let server = MockServer::start();
        let _next = mock_next(&server, "\"ping\"");
        let invocation_error = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/2018-06-01/runtime/invocation/{REQUEST_ID}/error"))
                .body_contains("Lambda panicked: this is intentionally here");
            then.status(202).body("");
        });

        let handler = service_fn(|_event: LambdaEvent<String>| async move {
            if true {
                panic!("this is intentionally here");
            }
            Ok::<String, Error>(String::new())
        });
        Runtime::new(handler)
            .with_config(config_for(&server, 1))
            .run()
            .await?;

        assert_eq!(invocation_error.hits(), 1);
        Ok(())
    }
}
