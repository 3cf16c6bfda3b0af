//! WebSocket JSON-RPC gateway: the single dispatch surface binding chat
//! surfaces to the execution plane. Handles auth, per-connection rate limits,
//! request dispatch, and best-effort broadcast of task/approval events.

pub mod protocol;

use crate::approval::ApprovalManager;
use crate::bus::{CancelToken, Event, EventBus};
use crate::config::GatewayConfig;
use crate::errors::{CodedError, ErrorCode};
use crate::orchestrator::task::TaskMessage;
use crate::orchestrator::Orchestrator;
use crate::session::SessionStore;
use crate::tools::{InvokeOutcome, ToolRuntime};
use crate::utils::redact;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use protocol::{notification, response_err, response_ok, RpcError, RpcRequest};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RATE_WINDOW: Duration = Duration::from_secs(60);
const AUTH_RATE_LIMIT: usize = 120;
const ANON_RATE_LIMIT: usize = 30;
const AUTH_MAX_OUTSTANDING: usize = 32;
const ANON_MAX_OUTSTANDING: usize = 8;

/// Per-connection client record. The sender feeds the connection's write
/// loop; a stuck client only backs up its own queue.
struct ClientHandle {
    id: String,
    sender: mpsc::UnboundedSender<String>,
    authenticated: AtomicBool,
    client_type: Mutex<Option<String>>,
    window: Mutex<Vec<Instant>>,
    outstanding: AtomicUsize,
}

impl ClientHandle {
    fn send(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Sliding-window admission. Tokenless clients get the aggressive tier.
    fn admit(&self) -> Result<(), RpcError> {
        let authenticated = self.authenticated.load(Ordering::SeqCst);
        let (rate_limit, max_outstanding) = if authenticated {
            (AUTH_RATE_LIMIT, AUTH_MAX_OUTSTANDING)
        } else {
            (ANON_RATE_LIMIT, ANON_MAX_OUTSTANDING)
        };

        if self.outstanding.load(Ordering::SeqCst) >= max_outstanding {
            return Err(RpcError::app(&CodedError::new(
                ErrorCode::ConcurrencyLimit,
                "too many outstanding requests",
            )));
        }

        let now = Instant::now();
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let cutoff = now.checked_sub(RATE_WINDOW).unwrap_or(now);
        window.retain(|&t| t > cutoff);
        if window.len() >= rate_limit {
            return Err(RpcError::app(&CodedError::new(
                ErrorCode::ResourceExhausted,
                "rate limit exceeded",
            )));
        }
        window.push(now);
        Ok(())
    }
}

/// Channels known to the gateway. Absent channels are implicitly enabled;
/// `channel.disable` is the only thing that blocks admission.
pub struct ChannelRegistry {
    inner: Mutex<HashMap<String, bool>>,
}

impl ChannelRegistry {
    pub fn from_config(channels: &HashMap<String, crate::config::ChannelConfig>) -> Self {
        Self {
            inner: Mutex::new(
                channels
                    .iter()
                    .map(|(id, c)| (id.clone(), c.enabled))
                    .collect(),
            ),
        }
    }

    pub fn list(&self) -> Vec<(String, bool)> {
        let mut entries: Vec<(String, bool)> = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }

    pub fn add(&self, id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(id.to_string())
            .or_insert(true);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(id)
        {
            Some(state) => {
                *state = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(true)
    }
}

pub struct Gateway {
    orchestrator: Arc<Orchestrator>,
    runtime: Arc<ToolRuntime>,
    approvals: Arc<ApprovalManager>,
    sessions: Arc<SessionStore>,
    channels: ChannelRegistry,
    bus: EventBus,
    auth: GatewayConfig,
    clients: RwLock<HashMap<String, Arc<ClientHandle>>>,
    started_at: Instant,
}

fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        runtime: Arc<ToolRuntime>,
        approvals: Arc<ApprovalManager>,
        sessions: Arc<SessionStore>,
        channels: ChannelRegistry,
        bus: EventBus,
        auth: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            runtime,
            approvals,
            sessions,
            channels,
            bus,
            auth,
            clients: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
        })
    }

    /// Bind and serve. Non-loopback binds refuse to start without a token.
    pub async fn serve(self: Arc<Self>, host: &str, port: u16) -> anyhow::Result<()> {
        if !is_loopback_host(host) && !self.auth.has_token() {
            anyhow::bail!(
                "refusing to bind gateway on non-loopback {} without a token",
                host
            );
        }
        let listener = TcpListener::bind((host, port)).await?;
        info!("gateway listening on ws://{}:{}", host, port);
        self.serve_on_listener(listener).await
    }

    /// Serve on an existing listener (tests bind 127.0.0.1:0 and pass it in).
    pub async fn serve_on_listener(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        self.clone().spawn_broadcaster();
        let app = Router::new()
            .route("/", any(ws_handler))
            .route("/ws", any(ws_handler))
            .with_state(self);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    /// Fan bus events out to every connected client. Delivery is best-effort:
    /// a failed send is logged and skipped.
    fn spawn_broadcaster(self: Arc<Self>) {
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("broadcast subscriber lagged, {} event(s) dropped", missed);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                let Some(frame) = event_notification(&event) else {
                    continue;
                };
                let clients = self.clients.read().await;
                for client in clients.values() {
                    if !client.send(frame.clone()) {
                        debug!(client = %client.id, "dropping broadcast to closed client");
                    }
                }
            }
        });
    }

    async fn client_loop(self: Arc<Self>, socket: WebSocket, addr: SocketAddr) {
        let client_id = format!("client-{}", Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handle = Arc::new(ClientHandle {
            id: client_id.clone(),
            sender: tx,
            // With no token configured the gateway is loopback-only and local
            // clients get the authenticated tier.
            authenticated: AtomicBool::new(!self.auth.has_token()),
            client_type: Mutex::new(None),
            window: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        });
        self.clients
            .write()
            .await
            .insert(client_id.clone(), Arc::clone(&handle));
        debug!(client = %client_id, peer = %addr, "client connected");

        let (mut sink, mut stream) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(received) = stream.next().await {
            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    debug!(client = %client_id, "read error: {}", e);
                    break;
                }
            };
            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                _ => continue,
            };
            self.clone().handle_frame(&handle, text);
        }

        self.clients.write().await.remove(&client_id);
        writer.abort();
        debug!(client = %client_id, "client disconnected");
    }

    /// Parse and dispatch one inbound frame. Handlers run in their own task
    /// so one slow request never stalls the connection's read loop or other
    /// clients.
    fn handle_frame(self: Arc<Self>, client: &Arc<ClientHandle>, text: String) {
        let request: RpcRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                client.send(response_err(
                    Value::Null,
                    RpcError::new(protocol::PARSE_ERROR, format!("parse error: {}", e)),
                ));
                return;
            }
        };

        let Some(id) = request.id.clone() else {
            // Client-to-server notification; nothing to respond to.
            debug!(method = %request.method, "ignoring client notification");
            return;
        };

        if let Err(error) = client.admit() {
            client.send(response_err(id, error));
            return;
        }

        let gateway = self;
        let client = Arc::clone(client);
        client.outstanding.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = gateway
                .dispatch(&client, &request.method, request.params)
                .await;
            client.outstanding.fetch_sub(1, Ordering::SeqCst);
            let frame = match result {
                Ok(result) => response_ok(id, result),
                Err(error) => response_err(id, error),
            };
            client.send(frame);
        });
    }

    async fn dispatch(
        &self,
        client: &Arc<ClientHandle>,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        if self.auth.has_token()
            && !client.authenticated.load(Ordering::SeqCst)
            && method != "connect"
        {
            return Err(RpcError::app(&CodedError::new(
                ErrorCode::AuthFailed,
                "authentication required",
            )));
        }

        match method {
            "connect" => self.handle_connect(client, params),
            "chat.send" => self.handle_chat_send(params),
            "chat.abort" => self.handle_chat_abort(params),
            "approval.respond" => self.handle_approval_respond(client, params),
            "approval.list" | "tools.getPending" => Ok(serde_json::json!({
                "requests": self.approvals.list_pending(),
            })),
            "tools.list" => Ok(serde_json::json!({ "tools": self.runtime.definitions() })),
            "tools.invoke" => self.handle_tools_invoke(client, params).await,
            "tools.approve" => self.handle_tools_approve(client, params),
            "tools.getInvocation" => self.handle_get_invocation(params),
            "session.get" => self.handle_session_get(params),
            "session.list" => self.handle_session_list(params),
            "session.send" => self.handle_session_send(params),
            "channel.list" => Ok(serde_json::json!({
                "channels": self
                    .channels
                    .list()
                    .into_iter()
                    .map(|(id, enabled)| serde_json::json!({"id": id, "enabled": enabled}))
                    .collect::<Vec<_>>(),
            })),
            "channel.add" => self.handle_channel_mutation(params, ChannelOp::Add),
            "channel.remove" => self.handle_channel_mutation(params, ChannelOp::Remove),
            "channel.enable" => self.handle_channel_mutation(params, ChannelOp::Enable),
            "channel.disable" => self.handle_channel_mutation(params, ChannelOp::Disable),
            "gateway.info" => Ok(self.info().await),
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn handle_connect(
        &self,
        client: &Arc<ClientHandle>,
        params: Value,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConnectParams {
            #[serde(default)]
            client_type: Option<String>,
            #[serde(default)]
            version: Option<String>,
            #[serde(default)]
            token: Option<String>,
        }
        let params: ConnectParams = parse_params(params)?;

        if let Some(token) = &params.token {
            if self.auth.verify_token(token) {
                client.authenticated.store(true, Ordering::SeqCst);
            } else {
                return Err(RpcError::app(&CodedError::new(
                    ErrorCode::AuthFailed,
                    "invalid token",
                )));
            }
        }
        *client
            .client_type
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = params.client_type.clone();
        debug!(
            client = %client.id,
            client_type = params.client_type.as_deref().unwrap_or("unknown"),
            version = params.version.as_deref().unwrap_or("unknown"),
            "handshake complete"
        );

        Ok(serde_json::json!({
            "clientId": client.id,
            "server": { "name": "moonbot", "version": crate::VERSION },
            "authenticated": client.authenticated.load(Ordering::SeqCst),
        }))
    }

    fn handle_chat_send(&self, params: Value) -> Result<Value, RpcError> {
        let message: TaskMessage = parse_params(params)?;
        if !self.channels.is_enabled(&message.channel_id) {
            return Err(RpcError::app(&CodedError::new(
                ErrorCode::Unauthorized,
                format!("channel '{}' is disabled", message.channel_id),
            )));
        }
        let response = self
            .orchestrator
            .create_task(message)
            .map_err(|e| RpcError::app(&e))?;
        Ok(serde_json::to_value(response).unwrap_or(Value::Null))
    }

    fn handle_chat_abort(&self, params: Value) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AbortParams {
            task_id: String,
        }
        let params: AbortParams = parse_params(params)?;
        self.orchestrator
            .abort_task(&params.task_id)
            .map_err(|e| RpcError::app(&e))?;
        Ok(serde_json::json!({ "ok": true }))
    }

    fn handle_approval_respond(
        &self,
        client: &Arc<ClientHandle>,
        params: Value,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RespondParams {
            request_id: String,
            approved: bool,
        }
        let params: RespondParams = parse_params(params)?;
        // The responder identity is the connection's authenticated principal,
        // never anything carried in the request body.
        let status = self
            .orchestrator
            .grant_approval(&params.request_id, params.approved, &client.id)
            .map_err(|e| RpcError::app(&e))?;
        Ok(serde_json::json!({
            "requestId": params.request_id,
            "status": status,
        }))
    }

    async fn handle_tools_invoke(
        &self,
        client: &Arc<ClientHandle>,
        params: Value,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct InvokeParams {
            tool_id: String,
            #[serde(default)]
            session_id: Option<String>,
            #[serde(default, alias = "input")]
            args: Value,
            #[serde(default)]
            agent_id: Option<String>,
            #[serde(default)]
            user_id: Option<String>,
        }
        let params: InvokeParams = parse_params(params)?;
        let session_id = params.session_id.unwrap_or_else(|| "admin".to_string());
        let agent_id = params.agent_id.unwrap_or_else(|| "admin".to_string());
        let user_id = params.user_id.unwrap_or_else(|| client.id.clone());

        let cancel = CancelToken::new();
        let outcome = self
            .runtime
            .invoke(
                &params.tool_id,
                &session_id,
                params.args,
                &agent_id,
                &user_id,
                &cancel,
            )
            .await;

        if let InvokeOutcome::AwaitingApproval {
            invocation_id,
            request_id,
        } = &outcome
        {
            // Direct invocations have no parked agent loop, so the gateway
            // resumes them itself once the gate resolves.
            let runtime = Arc::clone(&self.runtime);
            let approvals = Arc::clone(&self.approvals);
            let invocation_id = invocation_id.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                if let Ok(status) = approvals.subscribe(&request_id).await {
                    let _ = runtime
                        .resume(&invocation_id, status, &CancelToken::new())
                        .await;
                }
            });
        }

        Ok(outcome_json(&outcome))
    }

    fn handle_tools_approve(
        &self,
        client: &Arc<ClientHandle>,
        params: Value,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ApproveParams {
            /// Approval request id, or the invocation id it is bound to.
            #[serde(alias = "invocationId")]
            request_id: String,
            #[serde(default = "default_approved")]
            approved: bool,
        }
        let params: ApproveParams = parse_params(params)?;
        let request_id = self
            .approvals
            .resolve_request_id(&params.request_id)
            .ok_or_else(|| {
                RpcError::app(&CodedError::new(
                    ErrorCode::NotFound,
                    "approval request not found",
                ))
            })?;
        let status = self
            .orchestrator
            .grant_approval(&request_id, params.approved, &client.id)
            .map_err(|e| RpcError::app(&e))?;
        if params.approved {
            Ok(serde_json::json!({ "ok": true, "requestId": request_id, "status": status }))
        } else {
            Ok(serde_json::json!({
                "ok": false,
                "requestId": request_id,
                "status": status,
                "error": { "code": ErrorCode::ApprovalDenied, "message": "approval was denied" },
            }))
        }
    }

    fn handle_get_invocation(&self, params: Value) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct GetInvocationParams {
            invocation_id: String,
        }
        let params: GetInvocationParams = parse_params(params)?;
        let invocation = self
            .runtime
            .invocation(&params.invocation_id)
            .ok_or_else(|| {
                RpcError::app(&CodedError::new(ErrorCode::NotFound, "invocation not found"))
            })?;
        Ok(serde_json::to_value(invocation).unwrap_or(Value::Null))
    }

    fn handle_session_get(&self, params: Value) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SessionGetParams {
            session_id: String,
            #[serde(default)]
            limit: Option<usize>,
        }
        let params: SessionGetParams = parse_params(params)?;
        let session = self
            .sessions
            .require(&params.session_id)
            .map_err(|e| RpcError::app(&e))?;
        let limit = params.limit.unwrap_or(crate::session::DEFAULT_PAGE_SIZE);
        Ok(serde_json::json!({
            "session": session.summary(),
            "entries": session.history(limit.min(crate::session::MAX_PAGE_SIZE)),
        }))
    }

    fn handle_session_list(&self, params: Value) -> Result<Value, RpcError> {
        #[derive(Deserialize, Default)]
        #[serde(rename_all = "camelCase", default)]
        struct SessionListParams {
            page: usize,
            page_size: Option<usize>,
        }
        let params: SessionListParams = if params.is_null() {
            SessionListParams::default()
        } else {
            parse_params(params)?
        };
        let (sessions, total) = self.sessions.list(params.page, params.page_size);
        Ok(serde_json::json!({
            "sessions": sessions,
            "total": total,
            "page": params.page,
        }))
    }

    fn handle_session_send(&self, params: Value) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SessionSendParams {
            session_id: String,
            text: String,
            #[serde(default)]
            user_id: Option<String>,
        }
        let params: SessionSendParams = parse_params(params)?;
        let session = self
            .sessions
            .require(&params.session_id)
            .map_err(|e| RpcError::app(&e))?;
        let message = TaskMessage {
            agent_id: session.agent_id.clone(),
            channel_id: session.channel_id.clone(),
            channel_session_id: Some(session.channel_session_id.clone()),
            user_id: params.user_id.unwrap_or_else(|| session.user_id.clone()),
            text: params.text,
        };
        if !self.channels.is_enabled(&message.channel_id) {
            return Err(RpcError::app(&CodedError::new(
                ErrorCode::Unauthorized,
                format!("channel '{}' is disabled", message.channel_id),
            )));
        }
        let response = self
            .orchestrator
            .create_task(message)
            .map_err(|e| RpcError::app(&e))?;
        Ok(serde_json::to_value(response).unwrap_or(Value::Null))
    }

    fn handle_channel_mutation(&self, params: Value, op: ChannelOp) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ChannelParams {
            channel_id: String,
        }
        let params: ChannelParams = parse_params(params)?;
        let found = match op {
            ChannelOp::Add => {
                self.channels.add(&params.channel_id);
                true
            }
            ChannelOp::Remove => self.channels.remove(&params.channel_id),
            ChannelOp::Enable => self.channels.set_enabled(&params.channel_id, true),
            ChannelOp::Disable => self.channels.set_enabled(&params.channel_id, false),
        };
        if !found {
            return Err(RpcError::app(&CodedError::new(
                ErrorCode::NotFound,
                "channel not found",
            )));
        }
        Ok(serde_json::json!({ "ok": true }))
    }

    async fn info(&self) -> Value {
        serde_json::json!({
            "name": "moonbot",
            "version": crate::VERSION,
            "uptimeSecs": self.started_at.elapsed().as_secs(),
            "clients": self.clients.read().await.len(),
            "pendingApprovals": self.approvals.list_pending().len(),
            "queueDepths": serde_json::to_value(self.orchestrator.queues().depths())
                .unwrap_or(Value::Null),
        })
    }
}

enum ChannelOp {
    Add,
    Remove,
    Enable,
    Disable,
}

fn default_approved() -> bool {
    true
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

/// Wire form of an invoke outcome with errors scrubbed for transport.
fn outcome_json(outcome: &InvokeOutcome) -> Value {
    match outcome {
        InvokeOutcome::Failure { error, meta } => {
            let public = redact::scrub_error(error);
            serde_json::json!({
                "ok": false,
                "error": { "code": public.code, "message": public.message },
                "meta": meta,
            })
        }
        other => other.to_json(),
    }
}

/// Map a bus event to its notification frame, sanitizing outbound errors.
fn event_notification(event: &Event) -> Option<String> {
    match event {
        Event::TaskFinished {
            task_id,
            channel_id,
            state,
            result,
            error,
        } => {
            let mut params = serde_json::json!({
                "taskId": task_id,
                "channelId": channel_id,
                "status": state.response_status(),
            });
            if let Some(result) = result {
                params["result"] = result.clone();
            }
            if let Some(error) = error {
                let public = redact::scrub_error(error);
                params["error"] =
                    serde_json::json!({ "code": public.code, "message": public.message });
            }
            Some(notification("chat.response", params))
        }
        Event::ApprovalRequested {
            request_id,
            invocation_id,
            tool_id,
            session_id,
            input,
            expires_at,
        } => Some(notification(
            "approval.requested",
            serde_json::json!({
                "requestId": request_id,
                "invocationId": invocation_id,
                "toolId": tool_id,
                "sessionId": session_id,
                "input": input,
                "expiresAt": expires_at,
            }),
        )),
        Event::ApprovalResolved { request_id, status } => Some(notification(
            "approval.resolved",
            serde_json::json!({ "requestId": request_id, "status": status }),
        )),
        // Progress stays internal unless a surface opts in.
        Event::TaskProgress { .. } => None,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| gateway.client_loop(socket, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("::1"));
        assert!(is_loopback_host("localhost"));
        assert!(!is_loopback_host("0.0.0.0"));
        assert!(!is_loopback_host("192.168.1.5"));
        assert!(!is_loopback_host("example.com"));
    }

    #[test]
    fn channel_registry_lifecycle() {
        let registry = ChannelRegistry::from_config(&HashMap::new());
        assert!(registry.is_enabled("c1")); // implicit

        registry.add("c1");
        assert!(registry.is_enabled("c1"));
        assert!(registry.set_enabled("c1", false));
        assert!(!registry.is_enabled("c1"));
        assert!(registry.set_enabled("c1", true));
        assert!(registry.remove("c1"));
        assert!(!registry.remove("c1"));
        assert!(!registry.set_enabled("missing", true));
    }

    #[test]
    fn rate_window_admits_then_limits() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ClientHandle {
            id: "client-test".into(),
            sender: tx,
            authenticated: AtomicBool::new(false),
            client_type: Mutex::new(None),
            window: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        };
        for _ in 0..ANON_RATE_LIMIT {
            assert!(client.admit().is_ok());
        }
        let err = client.admit().unwrap_err();
        assert_eq!(err.data.unwrap()["code"], "RESOURCE_EXHAUSTED");

        // The authenticated tier is roomier.
        client.authenticated.store(true, Ordering::SeqCst);
        assert!(client.admit().is_ok());
    }

    #[test]
    fn outstanding_cap_blocks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ClientHandle {
            id: "client-test".into(),
            sender: tx,
            authenticated: AtomicBool::new(false),
            client_type: Mutex::new(None),
            window: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(ANON_MAX_OUTSTANDING),
        };
        assert!(client.admit().is_err());
    }
}
