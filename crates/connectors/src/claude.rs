//! Claude CLI connector
//!
//! Spawns the `claude` CLI as a subprocess and talks to it over stdin/stdout
//! using the NDJSON stream-json protocol. User input arrives as an
//! `InputStream`; stdout lines are translated into `AgentEvent`s.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vaultpilot_protocol::{
    AgentEvent, McpServerConfig, MessageContent, OutboundMessage, PermissionDecision,
    PermissionMode, SlashCommandInfo, ToolPermissionRequest, UsageInfo,
};

use crate::connection::{AgentConnection, AgentLauncher, InputStream, LaunchConfig, LaunchedAgent};
use crate::permission::ToolPermissionHandler;
use crate::ConnectorError;

const CONTROL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

// ---------------------------------------------------------------------------
// Stdin messages (Rust → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        session_id: String,
        message: UserMessagePayload,
        parent_tool_use_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Initialize {},
    Interrupt,
    SetModel { model: Option<String> },
    SetMaxThinkingTokens { max_thinking_tokens: Option<u64> },
    SetPermissionMode { mode: String },
    McpSetServers { servers: Value },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
}

impl StdinMessage {
    fn user(msg: OutboundMessage) -> Self {
        let content = match msg.content {
            MessageContent::Text { text } => vec![UserContentBlock::Text { text }],
            MessageContent::Attachment { text, images } => {
                let mut blocks: Vec<UserContentBlock> = images
                    .into_iter()
                    .map(|image| UserContentBlock::Image {
                        source: ImageSource {
                            kind: "base64",
                            media_type: image.media_type,
                            data: image.data,
                        },
                    })
                    .collect();
                if !text.is_empty() {
                    blocks.push(UserContentBlock::Text { text });
                }
                blocks
            }
        };
        StdinMessage::User {
            session_id: msg.session_id,
            message: UserMessagePayload {
                role: "user",
                content,
            },
            parent_tool_use_id: None,
        }
    }
}

type PendingControls = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>>;

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Starts `claude` CLI subprocesses.
#[derive(Debug, Default, Clone)]
pub struct ClaudeCliLauncher;

#[async_trait]
impl AgentLauncher for ClaudeCliLauncher {
    async fn launch(
        &self,
        config: LaunchConfig,
        input: InputStream,
    ) -> Result<LaunchedAgent, ConnectorError> {
        let (connection, events) = ClaudeConnection::spawn(config, input).await?;
        Ok(LaunchedAgent {
            connection: Arc::new(connection),
            events,
        })
    }
}

// ---------------------------------------------------------------------------
// ClaudeConnection
// ---------------------------------------------------------------------------

pub struct ClaudeConnection {
    stdin_tx: mpsc::Sender<String>,
    pending_controls: PendingControls,
    commands: Mutex<Vec<SlashCommandInfo>>,
    abort: CancellationToken,
}

impl ClaudeConnection {
    /// Spawn a new `claude` CLI subprocess.
    async fn spawn(
        config: LaunchConfig,
        mut input: InputStream,
    ) -> Result<(Self, crate::connection::EventStream), ConnectorError> {
        let args = build_args(&config)?;

        info!(
            component = "claude_connector",
            event = "claude.spawn",
            cwd = %config.cwd.display(),
            claude_bin = %config.executable.display(),
            resume_id = ?config.resume_session_id,
            model = ?config.model,
            "Spawning Claude CLI"
        );

        let mut child = tokio::process::Command::new(&config.executable)
            .args(&args)
            .current_dir(&config.cwd)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CLAUDE_CODE_ENTRYPOINT", "vaultpilot")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectorError::SpawnError(format!("Failed to spawn claude CLI: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::SpawnError("No stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::SpawnError("No stdout on child".into()))?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let pending_controls: PendingControls = Arc::new(Mutex::new(HashMap::new()));
        let last_stderr: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        if let Some(stderr) = child.stderr.take() {
            let last_stderr = last_stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "claude_connector",
                        event = "claude.stderr",
                        line = %line,
                        "Claude CLI stderr"
                    );
                    if !line.trim().is_empty() {
                        *last_stderr.lock().await = Some(line);
                    }
                }
            });
        }

        tokio::spawn(stdin_writer(stdin, stdin_rx));

        // Pump user input from the message channel into stdin
        let pump_tx = stdin_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = input.next().await {
                let line = match serde_json::to_string(&StdinMessage::user(msg)) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(
                            component = "claude_connector",
                            event = "claude.input.serialize_error",
                            error = %e,
                            "Failed to serialize user message"
                        );
                        continue;
                    }
                };
                if pump_tx.send(line).await.is_err() {
                    break;
                }
            }
            debug!(
                component = "claude_connector",
                event = "claude.input.closed",
                "Input stream ended"
            );
        });

        // Hard abort: kill the child when the token fires
        let abort = config.abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {
                    let _ = child.kill().await;
                    debug!(
                        component = "claude_connector",
                        event = "claude.aborted",
                        "Claude CLI killed by abort signal"
                    );
                }
                status = child.wait() => {
                    info!(
                        component = "claude_connector",
                        event = "claude.exited",
                        status = ?status.ok(),
                        "Claude CLI exited"
                    );
                }
            }
        });

        tokio::spawn(event_loop(
            stdout,
            event_tx,
            pending_controls.clone(),
            config.permission_handler.clone(),
            stdin_tx.clone(),
            last_stderr,
        ));

        let connection = Self {
            stdin_tx,
            pending_controls,
            commands: Mutex::new(Vec::new()),
            abort: config.abort,
        };

        match connection
            .send_control_request(ControlRequestBody::Initialize {})
            .await
        {
            Ok(response) => {
                *connection.commands.lock().await = parse_commands(&response);
            }
            Err(e) => {
                warn!(
                    component = "claude_connector",
                    event = "claude.initialize.failed",
                    error = %e,
                    "Initialize control request failed"
                );
            }
        }

        Ok((connection, event_rx))
    }

    /// Send a control request and wait for the response.
    async fn send_control_request(&self, body: ControlRequestBody) -> Result<Value, ConnectorError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_controls.lock().await.insert(id.clone(), tx);

        let msg = StdinMessage::ControlRequest {
            request_id: id.clone(),
            request: body,
        };
        if let Err(e) = self.write_stdin_message(&msg).await {
            self.pending_controls.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_secs(CONTROL_TIMEOUT_SECS), rx).await {
            Ok(Ok(Ok(val))) => Ok(val),
            Ok(Ok(Err(message))) => Err(ConnectorError::ControlRejected(message)),
            Ok(Err(_)) => {
                self.pending_controls.lock().await.remove(&id);
                Err(ConnectorError::ChannelClosed)
            }
            Err(_) => {
                self.pending_controls.lock().await.remove(&id);
                Err(ConnectorError::ControlTimeout(CONTROL_TIMEOUT_SECS))
            }
        }
    }

    async fn write_stdin_message(&self, msg: &StdinMessage) -> Result<(), ConnectorError> {
        let json = serde_json::to_string(msg)?;
        debug!(
            component = "claude_connector",
            event = "claude.stdin.write",
            payload_len = json.len(),
            "Writing to CLI stdin"
        );
        self.stdin_tx
            .send(json)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }
}

#[async_trait]
impl AgentConnection for ClaudeConnection {
    async fn set_model(&self, model: Option<&str>) -> Result<(), ConnectorError> {
        self.send_control_request(ControlRequestBody::SetModel {
            model: model.map(String::from),
        })
        .await
        .map(|_| ())
    }

    async fn set_max_thinking_tokens(&self, tokens: Option<u64>) -> Result<(), ConnectorError> {
        self.send_control_request(ControlRequestBody::SetMaxThinkingTokens {
            max_thinking_tokens: tokens,
        })
        .await
        .map(|_| ())
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), ConnectorError> {
        self.send_control_request(ControlRequestBody::SetPermissionMode {
            mode: mode.as_str().to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn set_mcp_servers(
        &self,
        servers: &BTreeMap<String, McpServerConfig>,
    ) -> Result<(), ConnectorError> {
        let servers = serde_json::to_value(servers)?;
        self.send_control_request(ControlRequestBody::McpSetServers { servers })
            .await
            .map(|_| ())
    }

    async fn interrupt(&self) -> Result<(), ConnectorError> {
        self.send_control_request(ControlRequestBody::Interrupt)
            .await
            .map(|_| ())
    }

    fn abort(&self) {
        self.abort.cancel();
    }

    async fn supported_commands(&self) -> Result<Vec<SlashCommandInfo>, ConnectorError> {
        Ok(self.commands.lock().await.clone())
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Drains queued lines into the child's stdin.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.write_error",
                error = %e,
                "Failed to write to CLI stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.flush_error",
                error = %e,
                "Failed to flush CLI stdin"
            );
            break;
        }
    }
    debug!(
        component = "claude_connector",
        event = "claude.stdin.closed",
        "Stdin writer task ended"
    );
}

/// Read stdout line-by-line and forward translated events.
async fn event_loop(
    stdout: tokio::process::ChildStdout,
    event_tx: mpsc::Sender<Result<AgentEvent, ConnectorError>>,
    pending_controls: PendingControls,
    permission_handler: Arc<dyn ToolPermissionHandler>,
    stdin_tx: mpsc::Sender<String>,
    last_stderr: Arc<Mutex<Option<String>>>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let raw: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            component = "claude_connector",
                            event = "claude.stdout.parse_error",
                            error = %e,
                            line_preview = %preview(line),
                            "Failed to parse stdout JSON"
                        );
                        continue;
                    }
                };

                match raw.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "control_request" => {
                        spawn_permission_response(&raw, permission_handler.clone(), stdin_tx.clone());
                    }
                    "control_response" => {
                        handle_control_response(&raw, &pending_controls).await;
                    }
                    _ => {
                        for ev in translate_stdout_message(&raw) {
                            if event_tx.send(Ok(ev)).await.is_err() {
                                info!(
                                    component = "claude_connector",
                                    event = "claude.event_loop.channel_closed",
                                    "Event channel closed, stopping reader"
                                );
                                return;
                            }
                        }
                    }
                }
            }
            Ok(None) => {
                let reason = last_stderr
                    .lock()
                    .await
                    .take()
                    .unwrap_or_else(|| "cli_exited".to_string());
                info!(
                    component = "claude_connector",
                    event = "claude.stdout.eof",
                    reason = %reason,
                    "Claude CLI stdout EOF"
                );
                let _ = event_tx
                    .send(Err(ConnectorError::TransportClosed(reason)))
                    .await;
                break;
            }
            Err(e) => {
                error!(
                    component = "claude_connector",
                    event = "claude.stdout.read_error",
                    error = %e,
                    "Error reading CLI stdout"
                );
                let _ = event_tx.send(Err(ConnectorError::IoError(e))).await;
                break;
            }
        }
    }

    // Nobody will answer outstanding control requests any more
    pending_controls.lock().await.clear();
}

/// Answer a `can_use_tool` control request off the reader task so a slow
/// permission prompt never stalls stdout.
fn spawn_permission_response(
    raw: &Value,
    handler: Arc<dyn ToolPermissionHandler>,
    stdin_tx: mpsc::Sender<String>,
) {
    let Some((request_id, request, suggestions)) = parse_permission_request(raw) else {
        debug!(
            component = "claude_connector",
            event = "claude.control_request.unhandled",
            "Unhandled CLI control request"
        );
        return;
    };

    tokio::spawn(async move {
        debug!(
            component = "claude_connector",
            event = "claude.permission.requested",
            request_id = %request_id,
            tool_name = %request.tool_name,
            "CLI requesting tool permission"
        );
        let input = request.input.clone();
        let tool_use_id = request.tool_use_id.clone();
        let decision = handler.can_use_tool(request).await;
        let response = permission_response_payload(&decision, input, tool_use_id, suggestions);

        let msg = StdinMessage::ControlResponse {
            response: ControlResponsePayload::Success {
                request_id,
                response,
            },
        };
        match serde_json::to_string(&msg) {
            Ok(line) => {
                let _ = stdin_tx.send(line).await;
            }
            Err(e) => error!(
                component = "claude_connector",
                event = "claude.permission.serialize_error",
                error = %e,
                "Failed to serialize permission response"
            ),
        }
    });
}

/// Settle the pending control request a `control_response` answers.
async fn handle_control_response(raw: &Value, pending_controls: &PendingControls) {
    let Some(response) = raw.get("response") else {
        return;
    };
    let request_id = response
        .get("request_id")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if request_id.is_empty() {
        return;
    }

    let outcome = if response.get("subtype").and_then(|v| v.as_str()) == Some("error") {
        Err(response
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("control request failed")
            .to_string())
    } else {
        Ok(response.get("response").cloned().unwrap_or(Value::Null))
    };

    if let Some(tx) = pending_controls.lock().await.remove(request_id) {
        let _ = tx.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// Pure translation helpers
// ---------------------------------------------------------------------------

/// CLI arguments for one launch.
fn build_args(config: &LaunchConfig) -> Result<Vec<String>, ConnectorError> {
    let mut args: Vec<String> = [
        "--output-format",
        "stream-json",
        "--verbose",
        "--input-format",
        "stream-json",
        "--permission-prompt-tool",
        "stdio",
        "--include-partial-messages",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    if let Some(model) = &config.model {
        push("--model", model.clone());
    }
    if let Some(tokens) = config.max_thinking_tokens {
        push("--max-thinking-tokens", tokens.to_string());
    }
    push("--permission-mode", config.permission_mode.as_str().to_string());
    if let Some(sid) = &config.resume_session_id {
        push("--resume", sid.clone());
    }
    if let Some(prompt) = config.system_prompt.as_ref().filter(|p| !p.is_empty()) {
        push("--append-system-prompt", prompt.clone());
    }
    if !config.disallowed_tools.is_empty() {
        push("--disallowedTools", config.disallowed_tools.join(","));
    }
    if !config.mcp_servers.is_empty() {
        let mcp = json!({ "mcpServers": serde_json::to_value(&config.mcp_servers)? });
        push("--mcp-config", mcp.to_string());
    }
    for dir in &config.plugin_dirs {
        push("--plugin-dir", dir.display().to_string());
    }
    for dir in &config.additional_directories {
        push("--add-dir", dir.display().to_string());
    }
    if !config.setting_sources.is_empty() {
        push("--setting-sources", config.setting_sources.join(","));
    }

    Ok(args)
}

/// Translate one stdout JSON object into raw agent events.
fn translate_stdout_message(raw: &Value) -> Vec<AgentEvent> {
    let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match msg_type {
        "system" => translate_system(raw),
        "stream_event" => translate_stream_event(raw),
        "assistant" => translate_assistant(raw),
        "user" => translate_user(raw),
        "result" => vec![translate_result(raw)],
        "keep_alive" | "auth_status" | "tool_progress" | "control_cancel_request" => vec![],
        _ => {
            debug!(
                component = "claude_connector",
                event = "claude.stdout.unknown_type",
                msg_type = %msg_type,
                "Unknown stdout message type"
            );
            vec![]
        }
    }
}

fn translate_system(raw: &Value) -> Vec<AgentEvent> {
    if raw.get("subtype").and_then(|v| v.as_str()) != Some("init") {
        return vec![];
    }
    let Some(session_id) = raw.get("session_id").and_then(|v| v.as_str()) else {
        return vec![];
    };
    let model = raw.get("model").and_then(|v| v.as_str()).map(String::from);
    info!(
        component = "claude_connector",
        event = "claude.init",
        claude_session_id = %session_id,
        model = ?model,
        "Claude session initialized"
    );
    vec![AgentEvent::SessionInit {
        session_id: session_id.to_string(),
        model,
    }]
}

fn translate_stream_event(raw: &Value) -> Vec<AgentEvent> {
    let Some(event) = raw.get("event") else {
        return vec![];
    };
    if event.get("type").and_then(|v| v.as_str()) != Some("content_block_delta") {
        return vec![];
    }
    let Some(delta) = event.get("delta") else {
        return vec![];
    };
    match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "text_delta" => delta
            .get("text")
            .and_then(|v| v.as_str())
            .map(|text| AgentEvent::TextDelta {
                text: text.to_string(),
            })
            .into_iter()
            .collect(),
        "thinking_delta" => delta
            .get("thinking")
            .and_then(|v| v.as_str())
            .map(|text| AgentEvent::ThinkingDelta {
                text: text.to_string(),
            })
            .into_iter()
            .collect(),
        _ => vec![],
    }
}

fn translate_assistant(raw: &Value) -> Vec<AgentEvent> {
    let Some(blocks) = raw
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_array())
    else {
        debug!(
            component = "claude_connector",
            event = "claude.assistant.no_content_blocks",
            "Assistant message missing 'content' array"
        );
        return vec![];
    };

    blocks
        .iter()
        .filter_map(|block| {
            let text_of = |key: &str| {
                block
                    .get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text" => Some(AgentEvent::AssistantText {
                    text: text_of("text"),
                }),
                "thinking" => Some(AgentEvent::AssistantThinking {
                    text: text_of("thinking"),
                }),
                "tool_use" => Some(AgentEvent::ToolUse {
                    id: text_of("id"),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Echoed `user` messages carry tool results.
fn translate_user(raw: &Value) -> Vec<AgentEvent> {
    if raw
        .get("isReplay")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return vec![];
    }
    let Some(blocks) = raw
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_array())
    else {
        return vec![];
    };

    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_result"))
        .map(|block| {
            let content = block
                .get("content")
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .unwrap_or_default();
            AgentEvent::ToolResult {
                tool_use_id: block
                    .get("tool_use_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                content,
                is_error: block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            }
        })
        .collect()
}

fn translate_result(raw: &Value) -> AgentEvent {
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    let is_error = raw
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if is_error || subtype.starts_with("error") {
        let from_errors = raw
            .get("errors")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .filter(|s| !s.is_empty());
        let message = from_errors
            .or_else(|| {
                raw.get("result")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| {
                if subtype.is_empty() {
                    "error".to_string()
                } else {
                    subtype.to_string()
                }
            });
        return AgentEvent::Error { message };
    }

    let mut usage = extract_token_usage(raw.get("modelUsage"), raw.get("usage"));
    if let Some(cost) = raw.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.get_or_insert_with(|| UsageInfo {
            context_window: DEFAULT_CONTEXT_WINDOW,
            ..Default::default()
        })
        .cost_usd = Some(cost);
    }

    AgentEvent::Result {
        usage,
        session_id: raw
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

/// Extract token usage from the modelUsage or usage fields in result messages.
fn extract_token_usage(model_usage: Option<&Value>, usage: Option<&Value>) -> Option<UsageInfo> {
    // Per-model breakdown, summed across models
    if let Some(Value::Object(models)) = model_usage {
        let mut total = UsageInfo {
            context_window: DEFAULT_CONTEXT_WINDOW,
            ..Default::default()
        };
        for stats in models.values() {
            let field = |key: &str| stats.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
            total.input_tokens += field("inputTokens");
            total.output_tokens += field("outputTokens");
            total.cached_tokens += field("cacheReadInputTokens");
            if let Some(cw) = stats.get("contextWindow").and_then(|v| v.as_u64()) {
                total.context_window = cw;
            }
        }
        if total.input_tokens > 0 || total.output_tokens > 0 {
            return Some(total);
        }
    }

    let u = usage?;
    let field = |key: &str| u.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let (input, output) = (field("input_tokens"), field("output_tokens"));
    if input == 0 && output == 0 {
        return None;
    }
    Some(UsageInfo {
        input_tokens: input,
        output_tokens: output,
        cached_tokens: field("cache_read_input_tokens"),
        context_window: DEFAULT_CONTEXT_WINDOW,
        cost_usd: None,
    })
}

fn parse_permission_request(raw: &Value) -> Option<(String, ToolPermissionRequest, Option<Value>)> {
    let request = raw.get("request")?;
    if request.get("subtype").and_then(|v| v.as_str()) != Some("can_use_tool") {
        return None;
    }
    let request_id = raw.get("request_id").and_then(|v| v.as_str())?.to_string();
    let tool_name = request
        .get("tool_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let input = request.get("input").cloned().unwrap_or(Value::Null);
    let description = describe_tool_call(&tool_name, &input);

    Some((
        request_id,
        ToolPermissionRequest {
            tool_name,
            input,
            description,
            tool_use_id: request
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            blocked_path: request
                .get("blocked_path")
                .and_then(|v| v.as_str())
                .map(String::from),
        },
        request.get("permission_suggestions").cloned(),
    ))
}

fn describe_tool_call(tool_name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match tool_name {
        "Bash" => field("command")
            .map(|c| format!("Run command: {}", c))
            .unwrap_or_else(|| "Run a shell command".to_string()),
        "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => field("file_path")
            .map(|p| format!("Modify file: {}", p))
            .unwrap_or_else(|| format!("Use {}", tool_name)),
        "Read" => field("file_path")
            .map(|p| format!("Read file: {}", p))
            .unwrap_or_else(|| "Read a file".to_string()),
        _ => format!("Use {}", tool_name),
    }
}

/// The CLI requires the original input and tool use id echoed back.
fn permission_response_payload(
    decision: &PermissionDecision,
    input: Value,
    tool_use_id: Option<String>,
    suggestions: Option<Value>,
) -> Value {
    let mut payload = match decision {
        PermissionDecision::Allow | PermissionDecision::AllowAndRemember => {
            let mut allow = json!({ "behavior": "allow", "updatedInput": input });
            if matches!(decision, PermissionDecision::AllowAndRemember) {
                if let Some(suggestions) = suggestions {
                    allow["updatedPermissions"] = suggestions;
                }
            }
            allow
        }
        PermissionDecision::Deny { message } => json!({
            "behavior": "deny",
            "message": message,
            "interrupt": false,
        }),
        PermissionDecision::Interrupt { message } => json!({
            "behavior": "deny",
            "message": message,
            "interrupt": true,
        }),
    };
    if let Some(id) = tool_use_id {
        payload["toolUseID"] = json!(id);
    }
    payload
}

fn parse_commands(response: &Value) -> Vec<SlashCommandInfo> {
    response
        .get("commands")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|c| {
                    let name = c.get("name").and_then(|v| v.as_str())?;
                    Some(SlashCommandInfo {
                        name: name.to_string(),
                        description: c
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        argument_hint: c
                            .get("argumentHint")
                            .and_then(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn preview(line: &str) -> &str {
    let end = (0..=200.min(line.len()))
        .rev()
        .find(|&i| line.is_char_boundary(i))
        .unwrap_or(0);
    &line[..end]
}
