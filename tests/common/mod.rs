//! Shared fixture for integration tests: a full execution plane on temp
//! directories, optionally served over a real WebSocket.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use moonbot::approval::{ApprovalManager, ApprovalStore, BusNotifier};
use moonbot::bus::EventBus;
use moonbot::config::{ExecApprovals, GatewayConfig};
use moonbot::errors::CodedError;
use moonbot::gateway::{ChannelRegistry, Gateway};
use moonbot::orchestrator::planner::{DefaultReplanner, Planner, Step};
use moonbot::orchestrator::task::TaskMessage;
use moonbot::orchestrator::Orchestrator;
use moonbot::queue::ChannelQueues;
use moonbot::session::{SessionEntry, SessionStore};
use moonbot::tools::{Policy, Tool, ToolContext, ToolRuntime};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct Stack {
    pub orchestrator: Arc<Orchestrator>,
    pub runtime: Arc<ToolRuntime>,
    pub approvals: Arc<ApprovalManager>,
    pub sessions: Arc<SessionStore>,
    pub bus: EventBus,
    pub gateway: Arc<Gateway>,
    pub workspace: std::path::PathBuf,
    pub dir: tempfile::TempDir,
}

pub struct StackOptions {
    pub queue_bound: usize,
    pub workers: usize,
    pub policy: Policy,
    pub gateway_config: GatewayConfig,
    pub approval_ttl: Duration,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            queue_bound: 100,
            workers: 8,
            policy: Policy {
                allowed_commands: vec!["ls".into(), "echo".into(), "git".into()],
                ..Policy::default()
            },
            gateway_config: GatewayConfig::default(),
            approval_ttl: Duration::from_secs(300),
        }
    }
}

pub fn build_stack(
    planner: Arc<dyn Planner>,
    tools: Vec<Arc<dyn Tool>>,
    options: StackOptions,
) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let bus = EventBus::new();
    let store = ApprovalStore::open(dir.path().join("pending-approvals.json")).unwrap();
    let approvals = Arc::new(ApprovalManager::new(store, options.approval_ttl));
    approvals.register_handler(Arc::new(BusNotifier::new(bus.clone())));

    let runtime = Arc::new(ToolRuntime::new(
        Arc::clone(&approvals),
        ExecApprovals::default(),
        workspace.clone(),
        options.policy,
        10,
    ));
    for tool in tools {
        runtime.register(tool).unwrap();
    }

    let sessions = Arc::new(SessionStore::open(dir.path().join("sessions"), 50).unwrap());
    let queues = ChannelQueues::new(options.queue_bound, options.workers);
    let orchestrator = Orchestrator::new(
        queues,
        Arc::clone(&runtime),
        Arc::clone(&approvals),
        Arc::clone(&sessions),
        planner,
        Arc::new(DefaultReplanner::default()),
        bus.clone(),
    );

    let gateway = Gateway::new(
        Arc::clone(&orchestrator),
        Arc::clone(&runtime),
        Arc::clone(&approvals),
        Arc::clone(&sessions),
        ChannelRegistry::from_config(&HashMap::new()),
        bus.clone(),
        options.gateway_config,
    );

    Stack {
        orchestrator,
        runtime,
        approvals,
        sessions,
        bus,
        gateway,
        workspace,
        dir,
    }
}

/// Bind 127.0.0.1:0 and serve the stack's gateway. Returns the ws:// URL.
pub async fn spawn_gateway(stack: &Stack) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Arc::clone(&stack.gateway);
    tokio::spawn(async move {
        let _ = gateway.serve_on_listener(listener).await;
    });
    format!("ws://{}/", addr)
}

pub async fn ws_connect(url: &str) -> (WsWrite, WsRead) {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream.split()
}

/// Send a request and read frames until the response with the same id comes
/// back. Notifications received along the way are returned too.
pub async fn rpc_call(
    write: &mut WsWrite,
    read: &mut WsRead,
    id: u64,
    method: &str,
    params: Value,
) -> (Value, Vec<Value>) {
    let frame = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    write.send(Message::text(frame.to_string())).await.unwrap();

    let mut notifications = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), read.next())
            .await
            .expect("timed out waiting for response")
            .expect("stream closed")
            .unwrap();
        if !message.is_text() {
            continue;
        }
        let parsed: Value = serde_json::from_str(message.into_text().unwrap().as_str()).unwrap();
        if parsed.get("id").and_then(Value::as_u64) == Some(id) {
            return (parsed, notifications);
        }
        notifications.push(parsed);
    }
}

/// Find `method` among notifications already drained by an `rpc_call`, or
/// keep reading until it arrives.
pub async fn notification_in_or_after(
    read: &mut WsRead,
    prior: &[Value],
    method: &str,
    timeout: Duration,
) -> Value {
    for frame in prior {
        if frame["method"] == method {
            return frame["params"].clone();
        }
    }
    next_notification(read, method, timeout).await
}

/// Read frames until a notification for `method` arrives.
pub async fn next_notification(read: &mut WsRead, method: &str, timeout: Duration) -> Value {
    loop {
        let message = tokio::time::timeout(timeout, read.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", method))
            .expect("stream closed")
            .unwrap();
        if !message.is_text() {
            continue;
        }
        let parsed: Value = serde_json::from_str(message.into_text().unwrap().as_str()).unwrap();
        if parsed["method"] == method {
            return parsed["params"].clone();
        }
    }
}

// --- Test planners and tools ------------------------------------------------

/// Plans a single step invoking a fixed tool with fixed input.
pub struct SingleToolPlanner {
    pub tool_id: String,
    pub input: Value,
}

#[async_trait]
impl Planner for SingleToolPlanner {
    async fn plan(
        &self,
        _message: &TaskMessage,
        _history: &[SessionEntry],
    ) -> Result<Vec<Step>, CodedError> {
        Ok(vec![Step::tool(
            "step-1",
            format!("invoke {}", self.tool_id),
            self.tool_id.clone(),
            self.input.clone(),
        )])
    }
}

/// Plans one `test.sleep` step whose duration is the message text in
/// milliseconds (0 when unparsable).
pub struct SleepPlanner;

#[async_trait]
impl Planner for SleepPlanner {
    async fn plan(
        &self,
        message: &TaskMessage,
        _history: &[SessionEntry],
    ) -> Result<Vec<Step>, CodedError> {
        let ms: u64 = message.text.trim().parse().unwrap_or(0);
        Ok(vec![Step::tool(
            "step-1",
            format!("sleep {}ms", ms),
            "test.sleep",
            serde_json::json!({ "ms": ms }),
        )])
    }
}

/// Sleeps for `ms` then echoes it back.
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn id(&self) -> &str {
        "test.sleep"
    }
    fn description(&self) -> &str {
        "Sleep for the given number of milliseconds"
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "ms": { "type": "integer", "minimum": 0 } },
            "required": ["ms"]
        })
    }
    async fn run(&self, input: Value, _ctx: &ToolContext) -> Result<Value, CodedError> {
        let ms = input["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(serde_json::json!({ "sleptMs": ms }))
    }
}
