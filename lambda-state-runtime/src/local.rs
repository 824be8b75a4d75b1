//! In-process control plane for local development.
//!
//! When `AWS_LAMBDA_RUNTIME_API` is absent, the runtime starts this server
//! and connects to it instead: an HTTP server that speaks the Runtime API
//! on one side and accepts ad-hoc invocations on the other. `POST` a body
//! to the invocation endpoint (default `/invoke`) and the response is the
//! handler's output, exactly as Lambda would return it.
//!
//! The process leaves on stdin EOF or a stop signal.

use crate::config::Endpoint;
use crate::Error;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

const LOCAL_HOST_VAR: &str = "LOCAL_LAMBDA_HOST";
const LOCAL_PORT_VAR: &str = "LOCAL_LAMBDA_PORT";
const LOCAL_INVOCATION_ENDPOINT_VAR: &str = "LOCAL_LAMBDA_INVOCATION_ENDPOINT";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9001;
const DEFAULT_INVOCATION_ENDPOINT: &str = "/invoke";

/// Deadline handed out for local invocations.
const LOCAL_DEADLINE: Duration = Duration::from_secs(300);

struct ServerState {
    queue_tx: mpsc::Sender<QueuedInvoke>,
    queue_rx: Mutex<mpsc::Receiver<QueuedInvoke>>,
    pending: Mutex<HashMap<String, oneshot::Sender<LocalReply>>>,
    counter: AtomicU64,
}

struct QueuedInvoke {
    request_id: String,
    payload: Bytes,
    respond: oneshot::Sender<LocalReply>,
}

enum LocalReply {
    Response(Bytes),
    Error(Bytes),
}

/// Bind the local server and return the endpoint the runtime should
/// connect to. `close_tx` is flipped when stdin reaches EOF.
pub(crate) async fn start(close_tx: watch::Sender<bool>) -> Result<Endpoint, Error> {
    let host = env::var(LOCAL_HOST_VAR).unwrap_or_else(|_| DEFAULT_HOST.to_owned());
    let port = match env::var(LOCAL_PORT_VAR) {
        Ok(value) => value
            .parse::<u16>()
            .map_err(|_| Error::from(format!("invalid {LOCAL_PORT_VAR}: {value:?}")))?,
        Err(_) => DEFAULT_PORT,
    };
    let invoke_path =
        env::var(LOCAL_INVOCATION_ENDPOINT_VAR).unwrap_or_else(|_| DEFAULT_INVOCATION_ENDPOINT.to_owned());

    let listener = TcpListener::bind((host.as_str(), port)).await?;
    let addr = listener.local_addr()?;
    info!(
        "local lambda server listening on http://{addr}, invoke with POST {}",
        invoke_path
    );

    let (queue_tx, queue_rx) = mpsc::channel(16);
    let state = Arc::new(ServerState {
        queue_tx,
        queue_rx: Mutex::new(queue_rx),
        pending: Mutex::new(HashMap::new()),
        counter: AtomicU64::new(0),
    });

    tokio::spawn(accept_loop(listener, state, invoke_path));
    tokio::spawn(watch_stdin(close_tx));

    Ok(Endpoint {
        host: addr.ip().to_string(),
        port: addr.port(),
    })
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, invoke_path: String) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "local server failed to accept a connection");
                continue;
            }
        };
        let state = state.clone();
        let invoke_path = invoke_path.clone();
        tokio::spawn(async move {
            let served = hyper::server::conn::http1::Builder::new()
                .serve_connection(
                    TokioIo::new(stream),
                    service_fn(move |req| handle(state.clone(), invoke_path.clone(), req)),
                )
                .await;
            if let Err(err) = served {
                debug!(error = %err, "local server connection ended with an error");
            }
        });
    }
}

/// Flip the close signal when stdin reaches EOF.
async fn watch_stdin(close_tx: watch::Sender<bool>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    let _ = close_tx.send(true);
}

async fn handle(
    state: Arc<ServerState>,
    invoke_path: String,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Error> {
    let path = req.uri().path().to_owned();
    if req.method() == Method::POST && path == invoke_path {
        return invoke(state, req).await;
    }

    let segments: Vec<&str> = path.split('/').collect();
    match (req.method(), &segments[1..]) {
        (&Method::GET, ["2018-06-01", "runtime", "invocation", "next"]) => next_event(state).await,
        (&Method::POST, ["2018-06-01", "runtime", "invocation", id, "response"]) => {
            let id = (*id).to_owned();
            complete(state, id, req, LocalReply::Response).await
        }
        (&Method::POST, ["2018-06-01", "runtime", "invocation", id, "error"]) => {
            let id = (*id).to_owned();
            complete(state, id, req, LocalReply::Error).await
        }
        (&Method::POST, ["2018-06-01", "runtime", "init", "error"]) => {
            let body = req.into_body().collect().await?.to_bytes();
            error!(
                "runtime reported an initialization error: {}",
                String::from_utf8_lossy(&body)
            );
            empty_response(StatusCode::ACCEPTED)
        }
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

/// `POST /invoke`: queue the body as an event and wait for its result.
async fn invoke(state: Arc<ServerState>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Error> {
    let payload = req.into_body().collect().await?.to_bytes();
    let request_id = format!("local-{}", state.counter.fetch_add(1, Ordering::Relaxed) + 1);
    let (respond, result) = oneshot::channel();

    let queued = QueuedInvoke {
        request_id,
        payload,
        respond,
    };
    if state.queue_tx.send(queued).await.is_err() {
        return empty_response(StatusCode::SERVICE_UNAVAILABLE);
    }

    match result.await {
        Ok(LocalReply::Response(body)) => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::from(body))?),
        Ok(LocalReply::Error(body)) => Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header("content-type", "application/json")
            .body(Full::from(body))?),
        Err(_) => empty_response(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// `GET /next`: long-poll until an invocation is queued.
async fn next_event(state: Arc<ServerState>) -> Result<Response<Full<Bytes>>, Error> {
    let queued = {
        let mut queue = state.queue_rx.lock().await;
        queue.recv().await
    };
    let Some(queued) = queued else {
        return empty_response(StatusCode::SERVICE_UNAVAILABLE);
    };

    state
        .pending
        .lock()
        .await
        .insert(queued.request_id.clone(), queued.respond);

    let deadline = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_add(LOCAL_DEADLINE)
        .as_millis();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("lambda-runtime-aws-request-id", queued.request_id)
        .header("lambda-runtime-deadline-ms", deadline.to_string())
        .header(
            "lambda-runtime-invoked-function-arn",
            "arn:aws:lambda:local:000000000000:function:local",
        )
        .header("lambda-runtime-trace-id", "Root=1-local;Parent=local;Sampled=0")
        .body(Full::from(queued.payload))?)
}

/// `POST /{id}/response` and `/{id}/error`: resolve the pending invoke.
async fn complete(
    state: Arc<ServerState>,
    request_id: String,
    req: Request<Incoming>,
    wrap: fn(Bytes) -> LocalReply,
) -> Result<Response<Full<Bytes>>, Error> {
    let body = req.into_body().collect().await?.to_bytes();
    match state.pending.lock().await.remove(&request_id) {
        Some(respond) => {
            let _ = respond.send(wrap(body));
            empty_response(StatusCode::ACCEPTED)
        }
        None => {
            warn!(requestId = %request_id, "completion for an unknown invocation");
            empty_response(StatusCode::BAD_REQUEST)
        }
    }
}

fn empty_response(status: StatusCode) -> Result<Response<Full<Bytes>>, Error> {
    Ok(Response::builder().status(status).body(Full::from(Bytes::new()))?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, LambdaEvent, Runtime};
    use lambda_control_client::{body::Body, build_request, connect};
    use tower::service_fn;

    #[tokio::test]
    async fn invoke_round_trips_through_the_runtime() -> Result<(), Error> {
        // Bind an ephemeral port so parallel tests cannot collide.
        env::set_var(LOCAL_PORT_VAR, "0");
        let (close_tx, _close_rx) = watch::channel(false);
        let endpoint = start(close_tx).await?;

        let handler = service_fn(|event: LambdaEvent<serde_json::Value>| async move {
            Ok::<_, Error>(event.payload)
        });
        let config = Config {
            endpoint: Some(endpoint.clone()),
            max_invocations: 1,
            ..Config::default()
        };
        let runtime = tokio::spawn(Runtime::new(handler).with_config(config).run());

        let (mut conn, _closed) = connect(&endpoint.host, endpoint.port).await?;
        let req = build_request()
            .method(http::Method::POST)
            .uri(DEFAULT_INVOCATION_ENDPOINT)
            .body(Body::from(r#"{"message":"ping"}"#))?;
        let rsp = conn.send(req).await?;

        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(&rsp.into_body()[..], br#"{"message":"ping"}"#);

        runtime.await.expect("runtime panicked")?;
        Ok(())
    }
}
