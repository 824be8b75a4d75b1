use crate::diagnostic::ErrorEnvelope;
use crate::types::Invocation;
use crate::Error;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use lambda_control_client::{body::Body, build_request};
use std::str::FromStr;
use std::{error, fmt};

const HEADER_REQUEST_ID: &str = "lambda-runtime-aws-request-id";
const HEADER_DEADLINE_MS: &str = "lambda-runtime-deadline-ms";
const HEADER_FUNCTION_ARN: &str = "lambda-runtime-invoked-function-arn";
const HEADER_TRACE_ID: &str = "lambda-runtime-trace-id";
const HEADER_CLIENT_CONTEXT: &str = "lambda-runtime-client-context";
const HEADER_COGNITO_IDENTITY: &str = "lambda-runtime-cognito-identity";
const HEADER_ERROR_TYPE: &str = "lambda-runtime-function-error-type";
const HEADER_RESPONSE_MODE: &str = "lambda-runtime-function-response-mode";

const ERROR_TYPE_UNHANDLED: &str = "Unhandled";
const CONTENT_TYPE_STREAMING: &str = "application/vnd.awslambda.http-integration-response";

pub(crate) trait IntoRequest {
    fn into_req(self) -> Result<Request<Body>, Error>;
}

// /runtime/invocation/next
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct NextEventRequest;

impl IntoRequest for NextEventRequest {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let req = build_request()
            .method(Method::GET)
            .uri(Uri::from_static("/2018-06-01/runtime/invocation/next"))
            .body(Body::empty())?;
        Ok(req)
    }
}

// /runtime/invocation/{AwsRequestId}/response
pub(crate) struct InvocationResponseRequest<'a> {
    pub(crate) request_id: &'a str,
    pub(crate) body: Bytes,
}

impl<'a> IntoRequest for InvocationResponseRequest<'a> {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let uri = format!("/2018-06-01/runtime/invocation/{}/response", self.request_id);
        let uri = Uri::from_str(&uri)?;

        let req = build_request()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_LENGTH, self.body.len())
            .body(Body::from(self.body))?;
        Ok(req)
    }
}

// /runtime/invocation/{AwsRequestId}/response, emitted fragment by fragment
pub(crate) struct StreamingResponseRequest<'a> {
    pub(crate) request_id: &'a str,
    /// Whether the body starts with a metadata prelude.
    pub(crate) prelude: bool,
    pub(crate) body: Body,
}

impl<'a> IntoRequest for StreamingResponseRequest<'a> {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let uri = format!("/2018-06-01/runtime/invocation/{}/response", self.request_id);
        let uri = Uri::from_str(&uri)?;

        let mut builder = build_request()
            .method(Method::POST)
            .uri(uri)
            .header(TRANSFER_ENCODING, "chunked")
            .header(HEADER_RESPONSE_MODE, "streaming");
        if self.prelude {
            builder = builder.header(CONTENT_TYPE, CONTENT_TYPE_STREAMING);
        }
        Ok(builder.body(self.body)?)
    }
}

// /runtime/invocation/{AwsRequestId}/error
pub(crate) struct InvocationErrorRequest<'a> {
    pub(crate) request_id: &'a str,
    pub(crate) envelope: ErrorEnvelope,
}

impl<'a> IntoRequest for InvocationErrorRequest<'a> {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let uri = format!("/2018-06-01/runtime/invocation/{}/error", self.request_id);
        let uri = Uri::from_str(&uri)?;
        let body = serde_json::to_vec(&self.envelope)?;

        let req = build_request()
            .method(Method::POST)
            .uri(uri)
            .header(HEADER_ERROR_TYPE, ERROR_TYPE_UNHANDLED)
            .header(CONTENT_LENGTH, body.len())
            .body(Body::from(body))?;
        Ok(req)
    }
}

// /runtime/init/error
pub(crate) struct InitErrorRequest {
    pub(crate) envelope: ErrorEnvelope,
}

impl IntoRequest for InitErrorRequest {
    fn into_req(self) -> Result<Request<Body>, Error> {
        let body = serde_json::to_vec(&self.envelope)?;

        let req = build_request()
            .method(Method::POST)
            .uri(Uri::from_static("/2018-06-01/runtime/init/error"))
            .header(HEADER_ERROR_TYPE, ERROR_TYPE_UNHANDLED)
            .header(CONTENT_LENGTH, body.len())
            .body(Body::from(body))?;
        Ok(req)
    }
}

/// Decoded control-plane reply.
#[derive(Debug)]
pub(crate) enum ControlPlaneReply {
    /// A `/next` delivery.
    Invocation(Invocation),
    /// Acknowledgement of a posted response or error.
    Accepted,
    /// The control plane rejected the exchange (HTTP 400, 403 or 413).
    /// Not a transport failure; the reply carries no diagnostic.
    Rejected(ErrorEnvelope),
}

/// A reply that could not be decoded. Terminal for the runtime, but
/// distinct from a broken connection.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    MissingHeader(&'static str),
    InvalidHeader(&'static str),
    EmptyRequestId,
    NoBody,
    BadStatusCode(StatusCode),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::MissingHeader(name) => write!(f, "missing {name} header"),
            DecodeError::InvalidHeader(name) => write!(f, "invalid {name} header"),
            DecodeError::EmptyRequestId => f.write_str("next-event reply carried an empty request id"),
            DecodeError::NoBody => f.write_str("next-event reply carried no payload"),
            DecodeError::BadStatusCode(status) => write!(f, "unexpected status code from the runtime API: {status}"),
        }
    }
}

impl error::Error for DecodeError {}

pub(crate) fn decode_reply(parts: &http::response::Parts, body: Bytes) -> Result<ControlPlaneReply, DecodeError> {
    match parts.status {
        StatusCode::OK => Ok(ControlPlaneReply::Invocation(decode_invocation(
            &parts.headers,
            body,
        )?)),
        StatusCode::ACCEPTED => Ok(ControlPlaneReply::Accepted),
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::PAYLOAD_TOO_LARGE => {
            Ok(ControlPlaneReply::Rejected(ErrorEnvelope::empty()))
        }
        status => Err(DecodeError::BadStatusCode(status)),
    }
}

fn decode_invocation(headers: &HeaderMap, payload: Bytes) -> Result<Invocation, DecodeError> {
    let request_id = required(headers, HEADER_REQUEST_ID)?;
    if request_id.is_empty() {
        return Err(DecodeError::EmptyRequestId);
    }
    let deadline_ms = required(headers, HEADER_DEADLINE_MS)?
        .parse::<i64>()
        .map_err(|_| DecodeError::InvalidHeader(HEADER_DEADLINE_MS))?;
    let invoked_function_arn = required(headers, HEADER_FUNCTION_ARN)?.to_owned();
    let trace_id = required(headers, HEADER_TRACE_ID)?.to_owned();
    if payload.is_empty() {
        return Err(DecodeError::NoBody);
    }

    Ok(Invocation {
        request_id: request_id.to_owned(),
        deadline_ms,
        invoked_function_arn,
        trace_id,
        client_context: optional(headers, HEADER_CLIENT_CONTEXT)?,
        cognito_identity: optional(headers, HEADER_COGNITO_IDENTITY)?,
        payload,
    })
}

fn required<'h>(headers: &'h HeaderMap, name: &'static str) -> Result<&'h str, DecodeError> {
    headers
        .get(name)
        .ok_or(DecodeError::MissingHeader(name))?
        .to_str()
        .map_err(|_| DecodeError::InvalidHeader(name))
}

fn optional(headers: &HeaderMap, name: &'static str) -> Result<Option<String>, DecodeError> {
    match headers.get(name) {
        Some(value) => Ok(Some(
            value
                .to_str()
                .map_err(|_| DecodeError::InvalidHeader(name))?
                .to_owned(),
        )),
        None => Ok(None),
    }
}
