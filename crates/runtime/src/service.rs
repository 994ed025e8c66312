//! Caller-facing agent service
//!
//! `AgentService::query` is the single streaming operation hosts use. It
//! picks the persistent connection when it can, falls back to a cold
//! start when it cannot, and recovers once from an expired session by
//! replaying the local transcript. Every stream ends with exactly one
//! terminal chunk.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vaultpilot_connectors::{is_session_expired_message, AgentLauncher};
use vaultpilot_protocol::{OutboundMessage, SlashCommandInfo, StreamChunk};

use crate::channel::DiagnosticSink;
use crate::cold_start::{run_cold_start, ColdStartOutcome, ColdStartRequest};
use crate::config::SettingsSource;
use crate::history::build_prompt_with_history;
use crate::lifecycle::{ConnectionManager, EnsureReadyOptions, LifecycleError};
use crate::permission::{PermissionGate, PermissionHandler};
use crate::query::QueryRequest;
use crate::readiness::ReadinessListener;
use crate::router::ChunkSender;
use crate::snapshot::DesiredConnection;

/// How a cold start relates to the persistent conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColdMode {
    /// Independent turn; never touches the tracked session.
    Isolated,
    /// Stand-in for the persistent connection; continues its session.
    Fallback,
    /// Retry after an expired session, with the transcript replayed.
    Rebuild,
}

#[derive(Clone)]
pub struct AgentService {
    manager: Arc<ConnectionManager>,
    launcher: Arc<dyn AgentLauncher>,
    settings: Arc<dyn SettingsSource>,
    gate: Arc<PermissionGate>,
    cold_cancel: Arc<Mutex<CancellationToken>>,
}

impl AgentService {
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        settings: Arc<dyn SettingsSource>,
        permissions: Arc<dyn PermissionHandler>,
        diagnostics: DiagnosticSink,
    ) -> Self {
        let gate = Arc::new(PermissionGate::new(settings.clone(), permissions));
        let manager = ConnectionManager::new(
            launcher.clone(),
            settings.clone(),
            gate.clone(),
            diagnostics,
        );
        Self {
            manager,
            launcher,
            settings,
            gate,
            cold_cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Stream one response. Failures arrive in-band as `StreamChunk::Error`.
    pub fn query(&self, request: QueryRequest) -> mpsc::UnboundedReceiver<StreamChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = self.clone();
        tokio::spawn(async move {
            service.run_query(request, &tx).await;
        });
        rx
    }

    async fn run_query(&self, request: QueryRequest, tx: &ChunkSender) {
        let settings = self.settings.current();
        let desired = match DesiredConnection::resolve(&settings, Some(&request.options)) {
            Ok(desired) => desired,
            Err(e) => {
                let _ = tx.send(StreamChunk::error(e.to_string()));
                return;
            }
        };

        if request.options.force_cold_start {
            self.run_cold(&request, desired, ColdMode::Isolated, tx).await;
            return;
        }

        // Held until this function returns, so no other query can reshape
        // or restart the connection while this turn is being prepared,
        // streamed or recovered.
        let claim = match self.manager.router().claim() {
            Ok(claim) => claim,
            Err(e) => {
                let _ = tx.send(StreamChunk::error(e.to_string()));
                return;
            }
        };

        if let Err(e) = self.prepare_persistent(&request).await {
            info!(
                component = "service",
                event = "query.fallback_to_cold_start",
                error = %e,
            );
            let mode = if e.is_session_expired() && !request.history.is_empty() {
                self.manager.session().invalidate_session();
                ColdMode::Rebuild
            } else {
                ColdMode::Fallback
            };
            self.run_cold(&request, desired, mode, tx).await;
            return;
        }

        let (prompt, rebuilt) = self.prompt_for_persistent(&request);
        let outbound = OutboundMessage::with_images(prompt, request.images.clone());
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();

        if let Err(e) = claim.activate(chunk_tx, outbound.clone()) {
            let _ = tx.send(StreamChunk::error(e.to_string()));
            return;
        }
        self.gate
            .set_allowed_tools(request.options.allowed_tools.clone());
        if let Err(e) = self.manager.enqueue(outbound).await {
            self.manager.router().unregister(claim.id());
            let _ = tx.send(StreamChunk::error(e.to_string()));
            return;
        }

        while let Some(chunk) = chunk_rx.recv().await {
            if !chunk.is_terminal() {
                let _ = tx.send(chunk);
                continue;
            }

            let interrupted = self.manager.session().take_interrupted();
            match chunk {
                StreamChunk::Error { .. } if interrupted => {
                    // The user stopped this turn; the agent's abort is not a failure
                    let _ = tx.send(StreamChunk::Done);
                }
                StreamChunk::Error { message } if is_session_expired_message(&message) => {
                    self.recover_expired_session(&request, desired, &message, tx)
                        .await;
                }
                StreamChunk::Done => {
                    if rebuilt {
                        self.manager.session().clear_history_rebuild();
                    }
                    let _ = tx.send(StreamChunk::Done);
                }
                other => {
                    let _ = tx.send(other);
                }
            }
            return;
        }

        let _ = tx.send(StreamChunk::error("Response ended unexpectedly"));
    }

    async fn prepare_persistent(&self, request: &QueryRequest) -> Result<(), LifecycleError> {
        if !self.manager.is_ready() {
            self.manager
                .ensure_ready(EnsureReadyOptions {
                    query: Some(request.options.clone()),
                    ..Default::default()
                })
                .await?;
        }
        self.manager
            .apply_dynamic_updates(Some(&request.options), true)
            .await?;
        if !self.manager.is_ready() {
            return Err(LifecycleError::NotReady);
        }
        Ok(())
    }

    /// Prefix the transcript when the remote side lost the conversation.
    /// The flag stays set until a turn carrying the transcript succeeds.
    fn prompt_for_persistent(&self, request: &QueryRequest) -> (String, bool) {
        if !self.manager.session().needs_history_rebuild() {
            return (request.prompt.clone(), false);
        }
        info!(
            component = "service",
            event = "query.history_rebuilt",
            turns = request.history.len(),
        );
        (
            build_prompt_with_history(&request.history, &request.prompt),
            true,
        )
    }

    async fn recover_expired_session(
        &self,
        request: &QueryRequest,
        desired: DesiredConnection,
        message: &str,
        tx: &ChunkSender,
    ) {
        warn!(
            component = "service",
            event = "query.session_expired",
            error = %message,
        );
        self.manager.session().invalidate_session();
        // Drop the connection still pointing at the dead session
        self.manager.close().await;

        if request.history.is_empty() {
            let _ = tx.send(StreamChunk::error(message));
            return;
        }
        self.run_cold(request, desired, ColdMode::Rebuild, tx).await;
    }

    async fn run_cold(
        &self,
        request: &QueryRequest,
        desired: DesiredConnection,
        mut mode: ColdMode,
        tx: &ChunkSender,
    ) {
        loop {
            let resume_session_id = match mode {
                ColdMode::Fallback => self.manager.session().session_id().map(str::to_string),
                ColdMode::Isolated | ColdMode::Rebuild => None,
            };
            let with_history = match mode {
                ColdMode::Rebuild => true,
                ColdMode::Fallback => self.manager.session().needs_history_rebuild(),
                ColdMode::Isolated => false,
            };
            let prompt = if with_history {
                build_prompt_with_history(&request.history, &request.prompt)
            } else {
                request.prompt.clone()
            };
            let cold_request = ColdStartRequest {
                prompt,
                images: request.images.clone(),
                desired: desired.clone(),
                resume_session_id,
                permission: Arc::new(self.gate.scoped(request.options.allowed_tools.clone())),
            };
            let cancel = self.cold_cancel_token();

            let result = run_cold_start(self.launcher.as_ref(), cold_request, &cancel, tx).await;

            if mode != ColdMode::Isolated {
                if let Some(session_id) = result.session_id.as_deref() {
                    self.manager.session().capture_session(session_id, None);
                }
            }

            let message = match result.outcome {
                ColdStartOutcome::Completed => {
                    if with_history {
                        // The transcript now lives in the captured session
                        self.manager.session().clear_history_rebuild();
                    }
                    let _ = tx.send(StreamChunk::Done);
                    return;
                }
                ColdStartOutcome::Cancelled => {
                    let _ = tx.send(StreamChunk::Done);
                    return;
                }
                ColdStartOutcome::Failed(message) => message,
            };

            let expired = is_session_expired_message(&message);
            if expired && mode != ColdMode::Isolated {
                self.manager.session().invalidate_session();
            }
            if expired
                && mode == ColdMode::Fallback
                && !request.history.is_empty()
                && !result.delivered_content
            {
                mode = ColdMode::Rebuild;
                continue;
            }
            let _ = tx.send(StreamChunk::error(message));
            return;
        }
    }

    fn cold_cancel_token(&self) -> CancellationToken {
        self.cold_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop whatever is running: interrupt the persistent turn and abort
    /// any cold start.
    pub async fn cancel(&self) {
        let streaming = self.manager.router().is_active();
        if streaming {
            self.manager.session().mark_interrupted();
        }
        {
            let mut token = self.cold_cancel.lock().unwrap_or_else(|e| e.into_inner());
            token.cancel();
            *token = CancellationToken::new();
        }
        if streaming {
            self.manager.interrupt().await;
        }
    }

    /// Forget the current conversation and start a fresh connection.
    pub async fn new_conversation(&self) -> Result<(), LifecycleError> {
        self.cancel().await;
        self.manager.session().reset();
        self.gate.set_allowed_tools(None);
        self.manager
            .ensure_ready(EnsureReadyOptions::forced())
            .await
            .map(|_| ())
    }

    /// Attach to a stored conversation and restart so the connection resumes it.
    pub async fn switch_conversation(
        &self,
        session_id: Option<String>,
    ) -> Result<(), LifecycleError> {
        self.cancel().await;
        self.manager.session().set_session_id(session_id);
        self.manager
            .ensure_ready(EnsureReadyOptions::forced())
            .await
            .map(|_| ())
    }

    /// One-shot: whether the stored session reference went stale.
    pub fn take_session_invalidation(&self) -> bool {
        self.manager.session().consume_invalidation()
    }

    pub fn session_id(&self) -> Option<String> {
        self.manager.session().session_id().map(str::to_string)
    }

    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    pub fn subscribe_readiness(&self, listener: ReadinessListener) -> u64 {
        self.manager.subscribe_readiness(listener)
    }

    pub fn unsubscribe_readiness(&self, id: u64) -> bool {
        self.manager.unsubscribe_readiness(id)
    }

    pub async fn supported_commands(&self) -> Result<Vec<SlashCommandInfo>, LifecycleError> {
        if !self.manager.is_ready() {
            self.manager.ensure_ready(Default::default()).await?;
        }
        self.manager.supported_commands().await
    }

    pub async fn shutdown(&self) {
        self.manager.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, SharedSettings};
    use crate::permission::ApproveAll;
    use crate::query::QueryOptions;
    use crate::testing::{eventually, MockLauncher, ScriptContext, ScriptedReply};
    use std::path::PathBuf;
    use vaultpilot_protocol::{AgentEvent, HistoryTurn};

    struct Fixture {
        _dir: tempfile::TempDir,
        launcher: Arc<MockLauncher>,
        service: AgentService,
    }

    fn fixture(launcher: MockLauncher) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("claude");
        std::fs::write(&bin, "").unwrap();
        let settings = Arc::new(SharedSettings::new(Settings {
            vault_path: Some(dir.path().to_path_buf()),
            cli_path: Some(bin),
            ..Default::default()
        }));
        let launcher = Arc::new(launcher);
        let service = AgentService::new(
            launcher.clone(),
            settings,
            Arc::new(ApproveAll),
            Arc::new(|_: &str| {}),
        );
        Fixture {
            _dir: dir,
            launcher,
            service,
        }
    }

    fn echo(ctx: &ScriptContext) -> Vec<ScriptedReply> {
        vec![
            Ok(AgentEvent::SessionInit {
                session_id: format!("s{}", ctx.launch_index),
                model: None,
            }),
            Ok(AgentEvent::TextDelta {
                text: ctx.message.content.text().to_string(),
            }),
            Ok(AgentEvent::Result {
                usage: None,
                session_id: None,
            }),
        ]
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    fn text_of(chunks: &[StreamChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn persistent_connection_serves_consecutive_queries() {
        let f = fixture(MockLauncher::with_script(echo));

        let first = collect(f.service.query(QueryRequest::new("one"))).await;
        assert_eq!(text_of(&first), "one");
        assert_eq!(first.last(), Some(&StreamChunk::Done));

        let second = collect(f.service.query(QueryRequest::new("two"))).await;
        assert_eq!(text_of(&second), "two");
        assert_eq!(f.launcher.launch_count(), 1);
        assert_eq!(f.service.session_id().as_deref(), Some("s0"));
    }

    #[tokio::test]
    async fn missing_vault_is_an_error_chunk() {
        let launcher = MockLauncher::new();
        let settings = Arc::new(SharedSettings::new(Settings::default()));
        let service = AgentService::new(
            Arc::new(launcher),
            settings,
            Arc::new(ApproveAll),
            Arc::new(|_: &str| {}),
        );
        let chunks = collect(service.query(QueryRequest::new("hi"))).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], StreamChunk::Error { message } if message.contains("vault")));
    }

    #[tokio::test]
    async fn forced_cold_start_leaves_session_alone() {
        let f = fixture(MockLauncher::with_script(echo));
        let request = QueryRequest::new("inline edit").with_options(QueryOptions {
            force_cold_start: true,
            allowed_tools: Some(vec!["Read".into()]),
            ..Default::default()
        });

        let chunks = collect(f.service.query(request)).await;
        assert_eq!(text_of(&chunks), "inline edit");
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
        assert_eq!(f.service.session_id(), None);
        assert!(!f.service.is_ready());
        assert!(f.launcher.handle(0).is_aborted());
    }

    #[tokio::test]
    async fn launch_failure_falls_back_to_cold_start() {
        let launcher = MockLauncher::with_script(echo);
        launcher.fail_next_launch("persistent start refused");
        let f = fixture(launcher);

        let chunks = collect(f.service.query(QueryRequest::new("hello"))).await;
        assert_eq!(text_of(&chunks), "hello");
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
        // The cold start's session becomes the tracked one
        assert_eq!(f.service.session_id().as_deref(), Some("s0"));
    }

    #[tokio::test]
    async fn expired_session_rebuilds_history_once() {
        let launcher = MockLauncher::with_script(|ctx| {
            if ctx.launch_index == 0 {
                return vec![Ok(AgentEvent::Error {
                    message: "No conversation found with session ID: old".into(),
                })];
            }
            echo(ctx)
        });
        let f = fixture(launcher);
        f.service
            .switch_conversation(Some("old".into()))
            .await
            .unwrap();

        let request = QueryRequest::new("and then?").with_history(vec![
            HistoryTurn::user("plan my week"),
            HistoryTurn::assistant("Monday: review notes."),
        ]);
        let chunks = collect(f.service.query(request)).await;

        let text = text_of(&chunks);
        assert!(text.contains("<conversation_history>"));
        assert!(text.contains("Monday: review notes."));
        assert!(text.ends_with("and then?"));
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
        assert_eq!(f.service.session_id().as_deref(), Some("s1"));
        assert_eq!(f.launcher.launch_config(1).resume_session_id, None);
    }

    #[tokio::test]
    async fn expired_session_without_history_is_surfaced() {
        let launcher = MockLauncher::with_script(|_| {
            vec![Ok(AgentEvent::Error {
                message: "No conversation found with session ID: old".into(),
            })]
        });
        let f = fixture(launcher);
        f.service
            .switch_conversation(Some("old".into()))
            .await
            .unwrap();

        let chunks = collect(f.service.query(QueryRequest::new("hi"))).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], StreamChunk::Error { .. }));
        assert!(f.service.take_session_invalidation());
        assert!(!f.service.take_session_invalidation());
    }

    #[tokio::test]
    async fn concurrent_query_leaves_running_turn_untouched() {
        let f = fixture(MockLauncher::new());
        let first = f.service.query(QueryRequest::new("slow"));
        eventually(|| f.service.manager().router().is_active()).await;
        let handle = f.launcher.handle(0);
        handle
            .emit(AgentEvent::TextDelta {
                text: "partial".into(),
            })
            .await;

        // Both a live-updatable and a restart-only difference
        let intruder = QueryRequest::new("fast").with_options(QueryOptions {
            model: Some("opus".into()),
            external_context_paths: vec![PathBuf::from("/research")],
            ..Default::default()
        });
        let second = collect(f.service.query(intruder)).await;
        assert_eq!(
            second,
            vec![StreamChunk::error("a response is already in progress")]
        );
        assert!(f.launcher.calls().is_empty());
        assert_eq!(f.launcher.launch_count(), 1);
        assert!(!handle.is_aborted());

        handle
            .emit(AgentEvent::Result {
                usage: None,
                session_id: None,
            })
            .await;
        assert_eq!(
            collect(first).await,
            vec![
                StreamChunk::Text {
                    content: "partial".into()
                },
                StreamChunk::Done
            ]
        );
    }

    #[tokio::test]
    async fn session_mismatch_prefixes_history_until_a_turn_succeeds() {
        let launcher = MockLauncher::with_script(|ctx| {
            let text = ctx.message.content.text().to_string();
            let session_id = if text == "one" { "s0" } else { "s-fresh" };
            let mut replies = vec![Ok(AgentEvent::SessionInit {
                session_id: session_id.into(),
                model: None,
            })];
            if text.ends_with("three") {
                replies.push(Ok(AgentEvent::Error {
                    message: "overloaded".into(),
                }));
                return replies;
            }
            replies.push(Ok(AgentEvent::TextDelta { text }));
            replies.push(Ok(AgentEvent::Result {
                usage: None,
                session_id: None,
            }));
            replies
        });
        let f = fixture(launcher);
        let history = vec![
            HistoryTurn::user("one"),
            HistoryTurn::assistant("Noted."),
            HistoryTurn::user("two"),
            HistoryTurn::assistant("Also noted."),
        ];

        collect(f.service.query(QueryRequest::new("one"))).await;
        collect(f.service.query(QueryRequest::new("two"))).await;
        assert!(f.service.manager().session().needs_history_rebuild());

        let failed = collect(
            f.service
                .query(QueryRequest::new("three").with_history(history.clone())),
        )
        .await;
        assert_eq!(failed, vec![StreamChunk::error("overloaded")]);
        assert!(f.service.manager().session().needs_history_rebuild());

        let retried =
            collect(f.service.query(QueryRequest::new("four").with_history(history))).await;
        let text = text_of(&retried);
        assert!(text.starts_with("<conversation_history>"));
        assert!(text.contains("Also noted."));
        assert!(text.ends_with("four"));
        assert_eq!(retried.last(), Some(&StreamChunk::Done));
        assert!(!f.service.manager().session().needs_history_rebuild());

        let plain = collect(f.service.query(QueryRequest::new("five"))).await;
        assert_eq!(text_of(&plain), "five");
        assert_eq!(f.launcher.launch_count(), 1);
    }

    fn expired_on_resume(ctx: &ScriptContext) -> Vec<ScriptedReply> {
        if ctx.resume_session_id.is_some() {
            return vec![Ok(AgentEvent::Error {
                message: "No conversation found with session ID: old".into(),
            })];
        }
        echo(ctx)
    }

    fn notes_history() -> Vec<HistoryTurn> {
        vec![
            HistoryTurn::user("plan my week"),
            HistoryTurn::assistant("Monday: review notes."),
        ]
    }

    #[tokio::test]
    async fn expired_fallback_retries_with_history() {
        let launcher = MockLauncher::with_script(expired_on_resume);
        launcher.fail_next_launch("persistent start refused");
        let f = fixture(launcher);
        f.service
            .manager()
            .session()
            .set_session_id(Some("old".into()));

        let request = QueryRequest::new("and then?").with_history(notes_history());
        let chunks = collect(f.service.query(request)).await;

        let text = text_of(&chunks);
        assert!(text.starts_with("<conversation_history>"));
        assert!(text.ends_with("and then?"));
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
        assert_eq!(f.launcher.launch_count(), 2);
        assert_eq!(
            f.launcher.launch_config(0).resume_session_id.as_deref(),
            Some("old")
        );
        assert_eq!(f.launcher.launch_config(1).resume_session_id, None);
        assert_eq!(f.service.session_id().as_deref(), Some("s1"));
        assert!(!f.service.manager().session().needs_history_rebuild());
    }

    #[tokio::test]
    async fn second_expiry_during_rebuild_is_surfaced_once() {
        let launcher = MockLauncher::with_script(|_| {
            vec![Ok(AgentEvent::Error {
                message: "No conversation found with session ID: old".into(),
            })]
        });
        launcher.fail_next_launch("persistent start refused");
        let f = fixture(launcher);
        f.service
            .manager()
            .session()
            .set_session_id(Some("old".into()));

        let request = QueryRequest::new("and then?").with_history(notes_history());
        let chunks = collect(f.service.query(request)).await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            &chunks[0],
            StreamChunk::Error { message } if is_session_expired_message(message)
        ));
        assert_eq!(f.launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_turn_ends_with_done() {
        let f = fixture(MockLauncher::new());
        let rx = f.service.query(QueryRequest::new("long task"));
        eventually(|| f.service.manager().router().is_active()).await;
        let handle = f.launcher.handle(0);
        handle
            .emit(AgentEvent::TextDelta {
                text: "partial".into(),
            })
            .await;

        f.service.cancel().await;
        assert!(f.launcher.calls().contains(&"interrupt".to_string()));
        handle
            .emit(AgentEvent::Error {
                message: "Request interrupted by user".into(),
            })
            .await;
        assert_eq!(
            collect(rx).await,
            vec![
                StreamChunk::Text {
                    content: "partial".into()
                },
                StreamChunk::Done
            ]
        );

        // The interruption was consumed; a later failure is reported
        let rx = f.service.query(QueryRequest::new("again"));
        eventually(|| f.service.manager().router().is_active()).await;
        handle
            .emit(AgentEvent::Error {
                message: "overloaded".into(),
            })
            .await;
        assert_eq!(collect(rx).await, vec![StreamChunk::error("overloaded")]);
    }

    #[tokio::test]
    async fn new_conversation_forces_fresh_connection() {
        let f = fixture(MockLauncher::with_script(echo));
        collect(f.service.query(QueryRequest::new("one"))).await;
        assert_eq!(f.service.session_id().as_deref(), Some("s0"));

        f.service.new_conversation().await.unwrap();
        assert_eq!(f.service.session_id(), None);
        assert_eq!(f.launcher.launch_count(), 2);
        assert_eq!(f.launcher.launch_config(1).resume_session_id, None);
    }

    #[tokio::test]
    async fn supported_commands_start_a_connection() {
        let f = fixture(MockLauncher::new());
        let commands = f.service.supported_commands().await.unwrap();
        assert_eq!(commands[0].name, "compact");
        assert!(f.service.is_ready());
    }
}
