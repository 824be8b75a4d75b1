#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs, nonstandard_style, rust_2018_idioms)]
#![allow(clippy::multiple_crate_versions)]

//! Connection-level HTTP client for the AWS Lambda Runtime API.
//!
//! A Lambda runtime talks to exactly one control-plane endpoint over one
//! keep-alive HTTP/1.1 connection, never has more than one request in
//! flight, and must notice when that connection goes away. A pooled client
//! hides all three facts, so this crate exposes the connection itself:
//! [`connect`] performs the handshake and hands back a [`Connection`]
//! together with a [`Closed`] future that resolves when the connection has
//! wound down.

use futures_util::{future::BoxFuture, FutureExt, TryFutureExt};
use http::{header::HOST, HeaderValue, Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

const USER_AGENT_HEADER: &str = "User-Agent";
const DEFAULT_USER_AGENT: &str = concat!("lambda-state-runtime/", env!("CARGO_PKG_VERSION"));
const CUSTOM_USER_AGENT: Option<&str> = option_env!("LAMBDA_RUNTIME_USER_AGENT");

/// Largest response body the client will aggregate.
///
/// This is the Lambda invocation payload cap: a `/next` body of exactly this
/// size is delivered, one byte more is a transport failure.
pub const MAX_RESPONSE_BYTES: usize = 6 * 1024 * 1024;

mod error;
pub use error::*;
pub mod body;

#[cfg(feature = "tracing")]
pub mod tracing;

use body::Body;

/// Future for a response queued with [`Connection::begin`].
pub type ResponseFuture = BoxFuture<'static, Result<Response<Incoming>, TransportError>>;

/// A single HTTP/1.1 keep-alive connection to the control plane.
///
/// Requests are serialized by the underlying connection: a second
/// [`begin`](Connection::begin) does not dispatch until the previous
/// response has been delivered, which makes pipelining impossible by
/// construction. Dropping the `Connection` shuts the connection down
/// gracefully once any in-flight exchange completes.
pub struct Connection {
    sender: SendRequest<Body>,
    host: HeaderValue,
}

/// Resolves once the connection driver has finished and the connection is
/// no longer usable.
pub struct Closed {
    rx: oneshot::Receiver<Option<hyper::Error>>,
}

impl Closed {
    /// Wait for the connection to wind down. Returns the error that took it
    /// down, or `None` for a clean close.
    ///
    /// Must not be awaited again after it has resolved.
    pub async fn wait(&mut self) -> Option<TransportError> {
        match (&mut self.rx).await {
            Ok(Some(err)) => Some(TransportError::Protocol(err)),
            // The driver was dropped without reporting; treat as clean.
            _ => None,
        }
    }
}

/// Establish the control-plane connection and spawn its driver task.
pub async fn connect(host: &str, port: u16) -> Result<(Connection, Closed), TransportError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(TransportError::Connect)?;
    let _ = stream.set_nodelay(true);

    let io = TokioIo::new(stream);
    let (sender, conn) = http1::handshake(io).await.map_err(TransportError::Protocol)?;

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = conn.await;
        let _ = tx.send(result.err());
    });

    let authority = format!("{host}:{port}");
    let host = HeaderValue::from_str(&authority)
        .map_err(|_| TransportError::InvalidEndpoint(authority.clone()))?;

    Ok((Connection { sender, host }, Closed { rx }))
}

impl Connection {
    /// Queue one request on the connection and return the owned future that
    /// resolves with its response.
    ///
    /// Splitting dispatch from completion lets the caller park the response
    /// future while it does other work: the connection driver keeps moving
    /// bytes either way. The request body is written to its end-of-message
    /// before the server's response is expected.
    pub async fn begin(&mut self, req: Request<Body>) -> Result<ResponseFuture, TransportError> {
        let req = self.prepare(req);
        self.sender.ready().await.map_err(TransportError::Protocol)?;
        Ok(self
            .sender
            .send_request(req)
            .map_err(TransportError::Protocol)
            .boxed())
    }

    /// Send a request and buffer the complete response.
    pub async fn send(&mut self, req: Request<Body>) -> Result<Response<bytes::Bytes>, TransportError> {
        let response = self.begin(req).await?.await?;
        aggregate(response).await
    }

    fn prepare(&self, req: Request<Body>) -> Request<Body> {
        let (mut parts, body) = req.into_parts();
        parts.headers.entry(HOST).or_insert_with(|| self.host.clone());
        Request::from_parts(parts, body)
    }
}

impl tower_service::Service<Request<Body>> for Connection {
    type Response = Response<Incoming>;
    type Error = TransportError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sender.poll_ready(cx).map_err(TransportError::Protocol)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let req = self.prepare(req);
        self.sender
            .send_request(req)
            .map_err(TransportError::Protocol)
            .boxed()
    }
}

/// Buffer a response body, enforcing [`MAX_RESPONSE_BYTES`].
pub async fn aggregate(response: Response<Incoming>) -> Result<Response<bytes::Bytes>, TransportError> {
    let (parts, body) = response.into_parts();
    let collected = http_body_util::Limited::new(body, MAX_RESPONSE_BYTES)
        .collect()
        .await
        .map_err(|err| match err.downcast::<hyper::Error>() {
            Ok(err) => TransportError::Protocol(*err),
            Err(_) => TransportError::ResponseTooLarge,
        })?;
    Ok(Response::from_parts(parts, collected.to_bytes()))
}

/// Create a request builder carrying the runtime's `User-Agent`.
///
/// Set the `LAMBDA_RUNTIME_USER_AGENT` environment variable at compile time
/// to override the value.
pub fn build_request() -> http::request::Builder {
    const USER_AGENT: &str = match CUSTOM_USER_AGENT {
        Some(value) => value,
        None => DEFAULT_USER_AGENT,
    };
    http::Request::builder().header(USER_AGENT_HEADER, USER_AGENT)
}
