#![deny(clippy::all, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]
#![warn(missing_docs, nonstandard_style, rust_2018_idioms)]

//! A state-machine driven execution core for AWS Lambda custom runtimes.
//!
//! The runtime fetches invocations from the [Lambda Runtime
//! API](https://docs.aws.amazon.com/lambda/latest/dg/runtimes-api.html),
//! dispatches them to a handler, and reports results or errors, for the
//! entire lifetime of the function process. All lifecycle decisions live in
//! a pure state machine; one cooperative loop executes its actions against
//! a single control-plane connection.
//!
//! Define a handler as a type that conforms to the [`tower::Service`]
//! trait and hand it to [`run`]:
//!
//! ```no_run
//! use lambda_state_runtime::{service_fn, Error, LambdaEvent};
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let func = service_fn(func);
//!     lambda_state_runtime::run(func).await?;
//!     Ok(())
//! }
//!
//! async fn func(event: LambdaEvent<Value>) -> Result<Value, Error> {
//!     Ok(event.payload)
//! }
//! ```
//!
//! Handlers come in four shapes, all byte-in/byte-out at the wire:
//! JSON-codable ([`run`]), raw bytes ([`run_bytes`]), streamed responses
//! ([`run_streaming`]) and background work after the response
//! ([`run_background`]). The [`Runtime`] builder exposes the same shapes
//! plus configuration and an async handler factory for cold-start-sensitive
//! initialization.

use std::future::Future;

mod background;
mod config;
mod deserializer;
mod diagnostic;
mod handler;
mod json;
#[cfg(feature = "local")]
mod local;
mod machine;
mod requests;
mod runtime;
mod signals;
mod streaming;
mod types;

pub use background::{BackgroundAdapter, BackgroundEvent, OutputWriter};
pub use config::{Config, Endpoint, StopSignal, RUNTIME_ENDPOINT_VAR};
pub use diagnostic::ErrorEnvelope;
pub use handler::{BytesAdapter, BytesFuture, InvocationHandler, ResponseChannel};
pub use json::{JsonAdapter, JsonFuture};
pub use lambda_control_client::TransportError;
pub use runtime::{Runtime, RuntimeError};
pub use streaming::{ResponseWriter, StreamingAdapter, StreamingEvent};
pub use types::{InvocationContext, InvocationOutcome, LambdaEvent, MetadataPrelude};

pub use tower::{self, service_fn, Service};

/// Error type that lambdas may result in.
pub type Error = lambda_control_client::BoxError;

/// Starts the runtime over a JSON-codable handler and polls for events
/// until shutdown.
pub async fn run<S, E, O>(handler: S) -> Result<(), Error>
where
    JsonAdapter<S, E, O>: InvocationHandler,
    S: Send + 'static,
{
    Runtime::new(handler).run().await
}

/// Starts the runtime over a byte-in/byte-out handler.
pub async fn run_bytes<S>(handler: S) -> Result<(), Error>
where
    BytesAdapter<S>: InvocationHandler,
    S: Send + 'static,
{
    Runtime::bytes(handler).run().await
}

/// Starts the runtime over a handler that streams its response through a
/// [`ResponseWriter`].
pub async fn run_streaming<S>(handler: S) -> Result<(), Error>
where
    StreamingAdapter<S>: InvocationHandler,
    S: Send + 'static,
{
    Runtime::streaming(handler).run().await
}

/// Starts the runtime over a handler that flushes its response through an
/// [`OutputWriter`] and continues with background work.
pub async fn run_background<S, E, O>(handler: S) -> Result<(), Error>
where
    BackgroundAdapter<S, E, O>: InvocationHandler,
    S: Send + 'static,
{
    Runtime::background(handler).run().await
}

/// Starts the runtime over a JSON-codable handler built by an asynchronous
/// factory. The factory runs concurrently with the control-plane
/// connection attempt; its failure is reported to `/runtime/init/error`.
pub async fn run_with_factory<F, Fut, S, E, O>(factory: F) -> Result<(), Error>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<S, Error>> + Send + 'static,
    JsonAdapter<S, E, O>: InvocationHandler,
    S: Send + 'static,
{
    Runtime::from_factory(factory).run().await
}
