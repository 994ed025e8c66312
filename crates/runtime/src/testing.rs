//! Scripted in-memory agent for tests.
//!
//! `MockLauncher` records every launch and every control call. Each
//! launch gets a `MockHandle` the test drives by hand, unless a script is
//! installed, in which case every delivered message is answered with the
//! script's events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vaultpilot_connectors::{
    AgentConnection, AgentLauncher, ConnectorError, InputStream, LaunchConfig, LaunchedAgent,
};
use vaultpilot_protocol::{
    AgentEvent, McpServerConfig, OutboundMessage, PermissionMode, SlashCommandInfo,
};

pub type ScriptedReply = Result<AgentEvent, ConnectorError>;

/// What a script sees for each delivered message.
pub struct ScriptContext {
    pub launch_index: usize,
    pub resume_session_id: Option<String>,
    pub message: OutboundMessage,
}

type Script = Arc<dyn Fn(&ScriptContext) -> Vec<ScriptedReply> + Send + Sync>;

#[derive(Clone)]
pub struct MockHandle {
    events: mpsc::Sender<ScriptedReply>,
    input: Arc<tokio::sync::Mutex<InputStream>>,
    abort: CancellationToken,
}

impl MockHandle {
    pub async fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(Ok(event)).await;
    }

    /// Fail the transport the way a dying process would.
    pub async fn fail(&self, message: &str) {
        let _ = self
            .events
            .send(Err(ConnectorError::TransportClosed(message.to_string())))
            .await;
    }

    /// Next message the connection read from its input, if one arrives soon.
    pub async fn next_input(&self) -> Option<OutboundMessage> {
        let mut input = self.input.lock().await;
        tokio::time::timeout(Duration::from_secs(1), input.next())
            .await
            .ok()
            .flatten()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

#[derive(Default)]
struct Recorded {
    launches: Vec<LaunchConfig>,
    handles: Vec<MockHandle>,
    calls: Vec<String>,
    launch_errors: Vec<String>,
}

#[derive(Default)]
pub struct MockLauncher {
    recorded: Arc<Mutex<Recorded>>,
    fail_live_updates: Arc<AtomicBool>,
    script: Mutex<Option<Script>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(
        script: impl Fn(&ScriptContext) -> Vec<ScriptedReply> + Send + Sync + 'static,
    ) -> Self {
        let launcher = Self::new();
        *launcher.script.lock().unwrap() = Some(Arc::new(script));
        launcher
    }

    pub fn fail_live_updates(&self, fail: bool) {
        self.fail_live_updates.store(fail, Ordering::SeqCst);
    }

    /// Make the next launch fail with this provider message.
    pub fn fail_next_launch(&self, message: &str) {
        self.recorded
            .lock()
            .unwrap()
            .launch_errors
            .push(message.to_string());
    }

    pub fn launch_count(&self) -> usize {
        self.recorded.lock().unwrap().launches.len()
    }

    pub fn launch_config(&self, index: usize) -> LaunchConfig {
        self.recorded.lock().unwrap().launches[index].clone()
    }

    pub fn handle(&self, index: usize) -> MockHandle {
        self.recorded.lock().unwrap().handles[index].clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.recorded.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl AgentLauncher for MockLauncher {
    async fn launch(
        &self,
        config: LaunchConfig,
        input: InputStream,
    ) -> Result<LaunchedAgent, ConnectorError> {
        let mut recorded = self.recorded.lock().unwrap();
        if !recorded.launch_errors.is_empty() {
            let message = recorded.launch_errors.remove(0);
            return Err(ConnectorError::ProviderError(message));
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let handle = MockHandle {
            events: events_tx,
            input: Arc::new(tokio::sync::Mutex::new(input)),
            abort: config.abort.clone(),
        };
        let launch_index = recorded.launches.len();

        if let Some(script) = self.script.lock().unwrap().clone() {
            tokio::spawn(run_script(
                script,
                handle.clone(),
                launch_index,
                config.resume_session_id.clone(),
            ));
        }

        recorded.launches.push(config);
        recorded.handles.push(handle.clone());
        drop(recorded);

        Ok(LaunchedAgent {
            connection: Arc::new(MockConnection {
                recorded: self.recorded.clone(),
                fail_live_updates: self.fail_live_updates.clone(),
                abort: handle.abort.clone(),
            }),
            events: events_rx,
        })
    }
}

async fn run_script(
    script: Script,
    handle: MockHandle,
    launch_index: usize,
    resume_session_id: Option<String>,
) {
    loop {
        let message = {
            let mut input = handle.input.lock().await;
            tokio::select! {
                _ = handle.abort.cancelled() => return,
                message = input.next() => message,
            }
        };
        let Some(message) = message else {
            return;
        };
        let context = ScriptContext {
            launch_index,
            resume_session_id: resume_session_id.clone(),
            message,
        };
        for reply in script(&context) {
            if handle.events.send(reply).await.is_err() {
                return;
            }
        }
    }
}

struct MockConnection {
    recorded: Arc<Mutex<Recorded>>,
    fail_live_updates: Arc<AtomicBool>,
    abort: CancellationToken,
}

impl MockConnection {
    fn record(&self, call: String) -> Result<(), ConnectorError> {
        self.recorded.lock().unwrap().calls.push(call);
        Ok(())
    }

    fn live_update(&self, call: String) -> Result<(), ConnectorError> {
        self.record(call)?;
        if self.fail_live_updates.load(Ordering::SeqCst) {
            return Err(ConnectorError::ControlRejected("unsupported".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentConnection for MockConnection {
    async fn set_model(&self, model: Option<&str>) -> Result<(), ConnectorError> {
        self.live_update(format!("set_model:{}", model.unwrap_or("default")))
    }

    async fn set_max_thinking_tokens(&self, tokens: Option<u64>) -> Result<(), ConnectorError> {
        self.live_update(format!("set_max_thinking_tokens:{:?}", tokens))
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), ConnectorError> {
        self.live_update(format!("set_permission_mode:{}", mode.as_str()))
    }

    async fn set_mcp_servers(
        &self,
        servers: &BTreeMap<String, McpServerConfig>,
    ) -> Result<(), ConnectorError> {
        let names: Vec<&str> = servers.keys().map(String::as_str).collect();
        self.live_update(format!("set_mcp_servers:{}", names.join(",")))
    }

    async fn interrupt(&self) -> Result<(), ConnectorError> {
        self.record("interrupt".into())
    }

    fn abort(&self) {
        let _ = self.record("abort".into());
        self.abort.cancel();
    }

    async fn supported_commands(&self) -> Result<Vec<SlashCommandInfo>, ConnectorError> {
        Ok(vec![SlashCommandInfo {
            name: "compact".into(),
            description: "Compact the conversation".into(),
            argument_hint: None,
        }])
    }
}

/// Poll `condition` until it holds; panic after a second.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
