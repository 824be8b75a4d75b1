use crate::diagnostic::ErrorEnvelope;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single event delivery fetched from the `/next` endpoint, as decoded
/// off the wire. Immutable once parsed; dropped when its result has been
/// acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub(crate) request_id: String,
    pub(crate) deadline_ms: i64,
    pub(crate) invoked_function_arn: String,
    pub(crate) trace_id: String,
    pub(crate) client_context: Option<String>,
    pub(crate) cognito_identity: Option<String>,
    pub(crate) payload: Bytes,
}

/// The per-invocation execution context handed to handlers.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// The AWS request ID generated by the Lambda service.
    pub request_id: String,
    /// The execution deadline, in milliseconds of Unix time.
    pub deadline_ms: i64,
    /// The ARN of the Lambda function, version, or alias being invoked.
    pub invoked_function_arn: String,
    /// The X-Ray trace ID for the current invocation.
    pub trace_id: String,
    /// Client context sent by the AWS Mobile SDK, when present.
    pub client_context: Option<String>,
    /// Cognito identity of the caller, when present.
    pub cognito_identity: Option<String>,
    /// 1-based count of invocations dispatched by this process.
    pub invocation_count: u64,
}

impl InvocationContext {
    pub(crate) fn new(invocation: &Invocation, invocation_count: u64) -> Self {
        InvocationContext {
            request_id: invocation.request_id.clone(),
            deadline_ms: invocation.deadline_ms,
            invoked_function_arn: invocation.invoked_function_arn.clone(),
            trace_id: invocation.trace_id.clone(),
            client_context: invocation.client_context.clone(),
            cognito_identity: invocation.cognito_identity.clone(),
            invocation_count,
        }
    }

    /// Time left until the control plane gives up on this invocation.
    pub fn remaining_time(&self) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Duration::from_millis(self.deadline_ms.saturating_sub(now).max(0) as u64)
    }

    /// The invocation's logger: a span tagged with the request id and the
    /// trace id, entered for everything the handler does.
    pub fn request_span(&self) -> tracing::Span {
        tracing::info_span!(
            "Lambda runtime invoke",
            requestId = %self.request_id,
            xrayTraceId = %self.trace_id
        )
    }
}

/// Incoming Lambda request containing the event payload and context.
#[derive(Clone, Debug)]
pub struct LambdaEvent<T> {
    /// Event payload.
    pub payload: T,
    /// Invocation context.
    pub context: InvocationContext,
}

impl<T> LambdaEvent<T> {
    /// Creates a new Lambda request
    pub fn new(payload: T, context: InvocationContext) -> Self {
        Self { payload, context }
    }

    /// Split the Lambda event into its payload and context.
    pub fn into_parts(self) -> (T, InvocationContext) {
        (self.payload, self.context)
    }
}

/// Metadata prelude of a streamed response.
///
/// Emitted as JSON ahead of the body, separated from it by a single NUL
/// byte; the control plane folds it into the HTTP response of the function
/// URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPrelude {
    /// The HTTP status code of the streamed response.
    #[serde(with = "http_serde::status_code")]
    pub status_code: StatusCode,
    /// The HTTP headers of the streamed response.
    #[serde(with = "http_serde::header_map")]
    pub headers: HeaderMap,
    /// The cookies set by the streamed response.
    pub cookies: Vec<String>,
}

/// What one invocation produced, as the loop reports it to the control
/// plane.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// Buffered response bytes, posted as one `/response` body. May be
    /// empty.
    Response(Bytes),
    /// The response already went out through the invocation's response
    /// channel; only the acknowledgement is still outstanding.
    Streamed,
    /// The handler failed; the envelope goes to `/error`.
    Fault(ErrorEnvelope),
}

#[cfg(test)]
mod test {
    use super::*;

    fn invocation() -> Invocation {
        Invocation {
            request_id: "8476a536-e9f4-11e8-9739-2dfe598c3fcd".into(),
            deadline_ms: 1_542_409_706_888,
            invoked_function_arn: "arn:aws:lambda:us-east-2:123456789012:function:custom-runtime".into(),
            trace_id: "Root=1-5bef4de7-ad49b0e87f6ef6c87fc2e700;Parent=9a9197af755a6419".into(),
            client_context: None,
            cognito_identity: None,
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn context_carries_invocation_fields() {
        let ctx = InvocationContext::new(&invocation(), 3);
        assert_eq!(ctx.request_id, "8476a536-e9f4-11e8-9739-2dfe598c3fcd");
        assert_eq!(ctx.deadline_ms, 1_542_409_706_888);
        assert_eq!(ctx.invocation_count, 3);
        assert!(ctx.client_context.is_none());
    }

    #[test]
    fn remaining_time_is_zero_past_deadline() {
        let mut inv = invocation();
        // A deadline far in the past.
        inv.deadline_ms = 1;
        let ctx = InvocationContext::new(&inv, 1);
        assert_eq!(ctx.remaining_time(), Duration::ZERO);
    }

    #[test]
    fn remaining_time_counts_down_from_future_deadline() {
        let mut inv = invocation();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        inv.deadline_ms = now + 60_000;
        let ctx = InvocationContext::new(&inv, 1);
        let remaining = ctx.remaining_time();
        assert!(remaining > Duration::from_secs(50));
        assert!(remaining <= Duration::from_secs(60));
    }

    #[test]
    fn prelude_serializes_with_camel_case_keys() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        let prelude = MetadataPrelude {
            status_code: StatusCode::OK,
            headers,
            cookies: vec!["cookie=yes".into()],
        };
        let encoded = serde_json::to_value(&prelude).expect("failed to serialize prelude");
        assert_eq!(encoded["statusCode"], 200);
        assert_eq!(encoded["headers"]["content-type"], "text/plain");
        assert_eq!(encoded["cookies"][0], "cookie=yes");
    }
}
