//! Wiring: build the execution plane from config and serve the gateway.

use crate::approval::{ApprovalManager, ApprovalStore, BusNotifier};
use crate::bus::EventBus;
use crate::config::{Config, ExecApprovals};
use crate::gateway::{ChannelRegistry, Gateway};
use crate::orchestrator::planner::{DefaultReplanner, EchoPlanner};
use crate::orchestrator::Orchestrator;
use crate::queue::ChannelQueues;
use crate::session::SessionStore;
use crate::tools::{Policy, ToolRuntime};
use crate::utils::{ensure_dir, moonbot_home};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct App {
    pub gateway: Arc<Gateway>,
    pub orchestrator: Arc<Orchestrator>,
    pub approvals: Arc<ApprovalManager>,
}

/// Assemble the execution plane: stores, runtime with the built-in tools,
/// queues, orchestrator, and the gateway bound to them.
pub fn build(config: &Config) -> Result<App> {
    let home = moonbot_home()?;
    ensure_dir(&home)?;
    let workspace = ensure_dir(config.workspace_path()?)?;

    let bus = EventBus::new();

    let store = ApprovalStore::open(home.join("pending-approvals.json"))
        .context("failed to open approval store")?;
    let approvals = Arc::new(ApprovalManager::new(
        store,
        Duration::from_secs(config.tools.approval_timeout_secs),
    ));
    approvals.register_handler(Arc::new(BusNotifier::new(bus.clone())));

    let exec_ledger = ExecApprovals::load(&home.join("exec-approvals.json"));
    let policy = Policy {
        allowed_commands: config.tools.allowed_commands.clone(),
        max_bytes: config.tools.max_bytes,
        timeout: Duration::from_secs(config.tools.timeout_secs),
    };
    let runtime = Arc::new(ToolRuntime::new(
        Arc::clone(&approvals),
        exec_ledger,
        workspace,
        policy,
        config.tools.concurrency,
    ));
    for tool in [
        Arc::new(crate::tools::fs::FsReadTool) as Arc<dyn crate::tools::Tool>,
        Arc::new(crate::tools::fs::FsWriteTool),
        Arc::new(crate::tools::fs::FsListTool),
        Arc::new(crate::tools::http::HttpRequestTool::new()),
        Arc::new(crate::tools::process::SystemRunTool),
        Arc::new(crate::tools::process::SystemShellTool),
    ] {
        runtime
            .register(tool)
            .map_err(|e| anyhow::anyhow!("tool registration: {}", e))?;
    }

    let sessions = Arc::new(
        SessionStore::open(config.sessions_path()?, config.sessions.compact_keep)
            .context("failed to open session store")?,
    );

    let queues = ChannelQueues::new(config.queue.bound, config.queue.workers);
    let orchestrator = Orchestrator::new(
        queues,
        Arc::clone(&runtime),
        Arc::clone(&approvals),
        Arc::clone(&sessions),
        Arc::new(EchoPlanner),
        Arc::new(DefaultReplanner::default()),
        bus.clone(),
    );

    let gateway = Gateway::new(
        Arc::clone(&orchestrator),
        runtime,
        Arc::clone(&approvals),
        sessions,
        ChannelRegistry::from_config(&config.channels),
        bus,
        config.gateway.clone(),
    );

    Ok(App {
        gateway,
        orchestrator,
        approvals,
    })
}

/// Run the gateway until ctrl-c, then drain tasks and fail pending approvals.
pub async fn run(config: Config) -> Result<()> {
    let app = build(&config)?;
    let _sweeper = app.approvals.spawn_sweeper();

    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    let orchestrator = Arc::clone(&app.orchestrator);

    tokio::select! {
        served = app.gateway.serve(&host, port) => served,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("received ctrl-c, shutting down");
            orchestrator.shutdown().await;
            Ok(())
        }
    }
}
