use std::{error, fmt, io};

/// Boxed error type used across the runtime crates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can happen while polling a request body.
#[derive(Debug)]
pub struct Error {
    inner: BoxError,
}

impl Error {
    /// Create a new `Error` from a boxable error.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self { inner: error.into() }
    }

    /// Convert the `Error` back into the underlying boxed trait object.
    pub fn into_inner(self) -> BoxError {
        self.inner
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.inner)
    }
}

/// Failure of the control-plane connection itself.
///
/// Everything in here is terminal for the runtime: the Lambda sandbox does
/// not expect a runtime to reconnect, it recycles the environment instead.
#[derive(Debug)]
pub enum TransportError {
    /// The TCP connection to the control plane could not be established.
    Connect(io::Error),
    /// HTTP-level failure while a request or response was in flight.
    Protocol(hyper::Error),
    /// The configured endpoint is not a valid authority.
    InvalidEndpoint(String),
    /// The next-event long poll exceeded the configured request timeout.
    Timeout,
    /// An aggregated response body exceeded [`MAX_RESPONSE_BYTES`].
    ///
    /// [`MAX_RESPONSE_BYTES`]: crate::MAX_RESPONSE_BYTES
    ResponseTooLarge,
    /// The connection closed while the runtime still needed it.
    ConnectionClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(err) => write!(f, "failed to connect to the runtime API: {err}"),
            TransportError::Protocol(err) => write!(f, "runtime API connection error: {err}"),
            TransportError::InvalidEndpoint(endpoint) => write!(f, "invalid runtime API endpoint: {endpoint}"),
            TransportError::Timeout => f.write_str("timed out waiting for the runtime API"),
            TransportError::ResponseTooLarge => f.write_str("runtime API response exceeded the aggregation cap"),
            TransportError::ConnectionClosed => f.write_str("runtime API connection closed unexpectedly"),
        }
    }
}

impl error::Error for TransportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TransportError::Connect(err) => Some(err),
            TransportError::Protocol(err) => Some(err),
            _ => None,
        }
    }
}
