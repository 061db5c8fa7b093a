//! The LM Handler: the single point through which sub-LM calls issued from
//! inside a REPL Environment reach an `LlmClient`. Exposes two transport
//! variants per the wire contract: a length-prefixed byte-stream channel for
//! same-host environments, and an HTTP broker (enqueue/pending/respond/health)
//! for sandboxed environments that cannot open a socket back to the host.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::llm::{CallUsage, LlmClient, LlmError, Message, UsageSummary};

/// A request for a sub-LM call, tagged with the depth it originates from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LmRequest {
    pub id: Uuid,
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub depth: usize,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub recursive: bool,
}

impl LmRequest {
    pub fn new(messages: Vec<Message>, depth: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages,
            model: None,
            depth,
            response_format: None,
            recursive: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LmResponse {
    pub id: Uuid,
    pub response: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
}

impl LmResponse {
    fn ok(id: Uuid, model: String, response: String, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            id,
            response,
            model,
            input_tokens,
            output_tokens,
            error: None,
        }
    }

    fn err(id: Uuid, model: String, error: HandlerError) -> Self {
        Self {
            id,
            response: String::new(),
            model,
            input_tokens: 0,
            output_tokens: 0,
            error: Some(error.to_string()),
        }
    }
}

/// A single point of dispatch: given a request's depth, pick the right
/// `LlmClient` and the right time budget, then place the call.
#[async_trait]
pub trait LmHandler: Send + Sync {
    async fn dispatch(&self, request: LmRequest) -> LmResponse;
}

/// Per-depth backend/time-budget routing, shared by both transports.
pub struct DepthRouter {
    root: Arc<dyn LlmClient>,
    other_backends: Vec<Arc<dyn LlmClient>>,
    root_timeout: Duration,
    min_timeout: Duration,
    step: Duration,
}

impl DepthRouter {
    pub fn new(
        root: Arc<dyn LlmClient>,
        other_backends: Vec<Arc<dyn LlmClient>>,
        root_timeout: Duration,
        min_timeout: Duration,
        step: Duration,
    ) -> Self {
        Self {
            root,
            other_backends,
            root_timeout,
            min_timeout,
            step,
        }
    }

    /// depth 0 -> root backend; depth i -> other_backends[i-1] if present, else root.
    pub fn backend_for_depth(&self, depth: usize) -> Arc<dyn LlmClient> {
        if depth == 0 {
            return self.root.clone();
        }
        self.other_backends
            .get(depth - 1)
            .cloned()
            .unwrap_or_else(|| self.root.clone())
    }

    /// time_at_depth(d) = max(min_timeout, root_timeout - d * step), monotonically non-increasing.
    pub fn time_at_depth(&self, depth: usize) -> Duration {
        let reduction = self.step.saturating_mul(depth as u32);
        self.root_timeout
            .checked_sub(reduction)
            .unwrap_or(Duration::ZERO)
            .max(self.min_timeout)
    }

    /// Every backend this router can dispatch to, root first. Used for
    /// usage accounting that must cover every depth a completion touched,
    /// not just the depth the caller happens to sit at.
    pub fn all_backends(&self) -> impl Iterator<Item = &Arc<dyn LlmClient>> {
        std::iter::once(&self.root).chain(self.other_backends.iter())
    }
}

/// The in-process `LmHandler`: dispatches directly against a `DepthRouter`,
/// enforcing the per-depth time budget and recursion-depth cutoff.
pub struct CoreHandler {
    router: Arc<DepthRouter>,
    recursive_max_depth: usize,
}

impl CoreHandler {
    pub fn new(router: Arc<DepthRouter>, recursive_max_depth: usize) -> Self {
        Self {
            router,
            recursive_max_depth,
        }
    }
}

#[async_trait]
impl LmHandler for CoreHandler {
    #[instrument(skip(self, request), fields(depth = request.depth, id = %request.id))]
    async fn dispatch(&self, request: LmRequest) -> LmResponse {
        if request.recursive && request.depth >= self.recursive_max_depth {
            return LmResponse::err(
                request.id,
                request.model.clone().unwrap_or_default(),
                HandlerError::DepthExhausted,
            );
        }
        let backend = self.router.backend_for_depth(request.depth);
        let timeout = self.router.time_at_depth(request.depth);
        let model_label = request.model.clone().unwrap_or_else(|| "unknown".to_owned());

        let call = async {
            if let Some(format) = &request.response_format {
                backend
                    .completion_structured(&request.messages, format)
                    .await
            } else {
                backend.completion(&request.messages, None).await
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(text)) => {
                let usage = backend.get_last_usage().unwrap_or_default();
                LmResponse::ok(request.id, model_label, text, usage.input_tokens, usage.output_tokens)
            }
            Ok(Err(err)) => LmResponse::err(request.id, model_label, HandlerError::Llm(err)),
            Err(_) => LmResponse::err(request.id, model_label, HandlerError::Timeout(timeout)),
        }
    }
}

// ---------------------------------------------------------------------
// Stream channel transport: 4-byte big-endian length prefix + UTF-8 JSON.
// ---------------------------------------------------------------------

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), HandlerError> {
    let len = payload.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|err| HandlerError::Unreachable(err.to_string()))?;
    writer
        .write_all(payload)
        .await
        .map_err(|err| HandlerError::Unreachable(err.to_string()))
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, HandlerError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|err| HandlerError::Unreachable(err.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| HandlerError::Unreachable(err.to_string()))?;
    Ok(payload)
}

/// Serves the stream transport: accepts connections, and for each one,
/// reads one `LmRequest` frame at a time, dispatches it, and writes back
/// the `LmResponse` frame. One outstanding request per connection.
pub struct StreamServer {
    handler: Arc<dyn LmHandler>,
}

impl StreamServer {
    pub fn new(handler: Arc<dyn LmHandler>) -> Self {
        Self { handler }
    }

    pub async fn bind(&self, addr: &str) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), HandlerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| HandlerError::Unreachable(err.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| HandlerError::Unreachable(err.to_string()))?;
        let handler = self.handler.clone();
        let join = tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "stream handler accept failed");
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(serve_connection(socket, handler));
            }
        });
        Ok((local_addr, join))
    }
}

async fn serve_connection(mut socket: TcpStream, handler: Arc<dyn LmHandler>) {
    loop {
        let payload = match read_frame(&mut socket).await {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let request: LmRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed stream request");
                return;
            }
        };
        let response = handler.dispatch(request).await;
        let encoded = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if write_frame(&mut socket, &encoded).await.is_err() {
            return;
        }
    }
}

/// Client-side helper used by a same-host, out-of-process REPL Environment
/// to send a request over the stream channel and await its response.
pub async fn send_stream_request(addr: &str, request: &LmRequest) -> Result<LmResponse, HandlerError> {
    let mut socket = TcpStream::connect(addr)
        .await
        .map_err(|err| HandlerError::Unreachable(err.to_string()))?;
    let encoded = serde_json::to_vec(request)
        .map_err(|err| HandlerError::MalformedRequest(err.to_string()))?;
    write_frame(&mut socket, &encoded).await?;
    let payload = read_frame(&mut socket).await?;
    serde_json::from_slice(&payload).map_err(|err| HandlerError::MalformedResponse(err.to_string()))
}

/// `LlmClient` seen from inside a sandboxed worker: it holds no API key and
/// no direct route to a provider. Every call is an HTTP POST to the broker's
/// `/enqueue` endpoint, tagged with the depth this client was built for; the
/// host-side `run_broker_dispatch_loop` is what actually owns credentials.
pub struct BrokerLmClient {
    http: reqwest::Client,
    broker_url: String,
    depth: usize,
    usage: std::sync::Mutex<UsageSummary>,
    last_usage: std::sync::Mutex<Option<CallUsage>>,
}

impl BrokerLmClient {
    pub fn new(broker_url: String, depth: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            broker_url,
            depth,
            usage: std::sync::Mutex::new(UsageSummary::default()),
            last_usage: std::sync::Mutex::new(None),
        }
    }

    async fn enqueue(&self, request: LmRequest) -> Result<LmResponse, LlmError> {
        let url = format!("{}/enqueue", self.broker_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(LlmError::Http)?;
        response.json::<LmResponse>().await.map_err(LlmError::Http)
    }
}

#[async_trait]
impl LlmClient for BrokerLmClient {
    async fn completion(
        &self,
        messages: &[Message],
        _max_completion_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        let request = LmRequest::new(messages.to_vec(), self.depth);
        let response = self.enqueue(request).await?;
        if let Some(message) = response.error {
            return Err(LlmError::Provider {
                status: 0,
                message,
            });
        }
        {
            let mut usage = self.usage.lock().expect("usage lock poisoned");
            usage.record(&response.model, response.input_tokens, response.output_tokens);
        }
        *self.last_usage.lock().expect("last usage lock poisoned") = Some(CallUsage {
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        });
        Ok(response.response)
    }

    fn get_usage_summary(&self) -> UsageSummary {
        self.usage.lock().expect("usage lock poisoned").clone()
    }

    fn get_last_usage(&self) -> Option<CallUsage> {
        *self.last_usage.lock().expect("last usage lock poisoned")
    }
}

// ---------------------------------------------------------------------
// HTTP broker transport: enqueue / pending / respond / health.
// ---------------------------------------------------------------------

/// Relays `LmRequest`/`LmResponse` between a sandboxed REPL (which can only
/// speak HTTP to a co-located broker) and the host process, which polls for
/// pending requests and dispatches them through an `LmHandler`.
pub struct Broker {
    pending: AsyncMutex<VecDeque<LmRequest>>,
    waiting: AsyncMutex<HashMap<Uuid, oneshot::Sender<LmResponse>>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            pending: AsyncMutex::new(VecDeque::new()),
            waiting: AsyncMutex::new(HashMap::new()),
        }
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the REPL side: submit a request and block until a
    /// matching response is delivered via `respond`.
    pub async fn enqueue(&self, request: LmRequest) -> Result<LmResponse, HandlerError> {
        let (tx, rx) = oneshot::channel();
        let id = request.id;
        self.waiting.lock().await.insert(id, tx);
        self.pending.lock().await.push_back(request);
        rx.await.map_err(|_| HandlerError::Canceled)
    }

    /// Called from the host side: drain all requests currently queued.
    pub async fn take_pending(&self) -> Vec<LmRequest> {
        let mut pending = self.pending.lock().await;
        pending.drain(..).collect()
    }

    /// Called from the host side: deliver a response to the waiting `enqueue` call.
    pub async fn respond(&self, response: LmResponse) -> bool {
        if let Some(tx) = self.waiting.lock().await.remove(&response.id) {
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }
}

#[derive(Deserialize)]
struct RespondBody {
    #[serde(flatten)]
    response: LmResponse,
}

async fn enqueue_handler(
    State(broker): State<Arc<Broker>>,
    Json(request): Json<LmRequest>,
) -> Result<Json<LmResponse>, StatusCode> {
    broker
        .enqueue(request)
        .await
        .map(Json)
        .map_err(|_| StatusCode::GATEWAY_TIMEOUT)
}

async fn pending_handler(State(broker): State<Arc<Broker>>) -> Json<Vec<LmRequest>> {
    Json(broker.take_pending().await)
}

async fn respond_handler(
    State(broker): State<Arc<Broker>>,
    Json(body): Json<RespondBody>,
) -> StatusCode {
    if broker.respond(body.response).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

pub fn broker_router(broker: Arc<Broker>) -> axum::Router {
    axum::Router::new()
        .route("/enqueue", post(enqueue_handler))
        .route("/pending", get(pending_handler))
        .route("/respond", post(respond_handler))
        .route("/health", get(health_handler))
        .with_state(broker)
}

/// Host-side loop: poll the broker for pending requests, dispatch each
/// through `handler`, and post the response back. Bounded exponential
/// backoff when the broker has nothing pending.
pub async fn run_broker_dispatch_loop(broker: Arc<Broker>, handler: Arc<dyn LmHandler>) {
    let mut idle_backoff = Duration::from_millis(10);
    const MAX_BACKOFF: Duration = Duration::from_millis(500);
    loop {
        let pending = broker.take_pending().await;
        if pending.is_empty() {
            tokio::time::sleep(idle_backoff).await;
            idle_backoff = (idle_backoff * 2).min(MAX_BACKOFF);
            continue;
        }
        idle_backoff = Duration::from_millis(10);
        for request in pending {
            let handler = handler.clone();
            let broker = broker.clone();
            tokio::spawn(async move {
                let response = handler.dispatch(request).await;
                broker.respond(response).await;
            });
        }
    }
}
