//! Persistent connection lifecycle
//!
//! `ConnectionManager` is the only owner of the long-lived agent
//! connection. It decides when to start, patch, restart or close it, and
//! it turns transport failures into a one-shot replay or a surfaced error.
//! Everything else asks it for readiness instead of touching the
//! connection directly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vaultpilot_connectors::{AgentConnection, AgentLauncher, ConnectorError, EventStream};
use vaultpilot_protocol::{OutboundMessage, SlashCommandInfo};

use crate::channel::{ChannelError, DiagnosticSink, EnqueueOutcome, MessageChannel};
use crate::config::SettingsSource;
use crate::permission::PermissionGate;
use crate::query::QueryOptions;
use crate::readiness::{ReadinessListener, ReadinessListeners};
use crate::router::{ResponseRouter, RouterError, TransportOutcome};
use crate::session::SessionTracker;
use crate::snapshot::{DesiredConnection, LiveField};

/// How long a graceful interrupt may take before the hard abort.
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("No vault folder is configured as the working directory")]
    NoWorkingDirectory,

    #[error("Claude CLI not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to start agent connection: {0}")]
    LaunchFailed(#[from] ConnectorError),

    #[error("No agent connection is running")]
    NotReady,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

impl LifecycleError {
    pub fn is_session_expired(&self) -> bool {
        match self {
            LifecycleError::LaunchFailed(e) => e.is_session_expired(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnsureReadyOptions {
    /// Close and start even when nothing changed.
    pub force: bool,
    /// Keep in-flight response handlers across the restart.
    pub preserve_handlers: bool,
    /// Request overrides folded into the desired configuration.
    pub query: Option<QueryOptions>,
}

impl EnsureReadyOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}

struct ActiveConnection {
    generation: u64,
    connection: Arc<dyn AgentConnection>,
    channel: MessageChannel,
    /// What the connection currently runs with; live updates patch it in place.
    desired: DesiredConnection,
    abort: CancellationToken,
}

pub struct ConnectionManager {
    weak_self: Weak<ConnectionManager>,
    launcher: Arc<dyn AgentLauncher>,
    settings: Arc<dyn SettingsSource>,
    session: Arc<Mutex<SessionTracker>>,
    router: ResponseRouter,
    gate: Arc<PermissionGate>,
    readiness: ReadinessListeners,
    diagnostics: DiagnosticSink,
    generation: AtomicU64,
    ready: AtomicBool,
    state: tokio::sync::Mutex<Option<ActiveConnection>>,
}

impl ConnectionManager {
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        settings: Arc<dyn SettingsSource>,
        gate: Arc<PermissionGate>,
        diagnostics: DiagnosticSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            launcher,
            settings,
            session: Arc::new(Mutex::new(SessionTracker::new())),
            router: ResponseRouter::new(),
            gate,
            readiness: ReadinessListeners::new(),
            diagnostics,
            generation: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(None),
        })
    }

    pub fn router(&self) -> &ResponseRouter {
        &self.router
    }

    pub fn session(&self) -> MutexGuard<'_, SessionTracker> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn subscribe_readiness(&self, listener: ReadinessListener) -> u64 {
        self.readiness.subscribe(listener)
    }

    pub fn unsubscribe_readiness(&self, id: u64) -> bool {
        self.readiness.unsubscribe(id)
    }

    fn set_ready(&self, ready: bool) {
        if self.ready.swap(ready, Ordering::SeqCst) != ready {
            self.readiness.notify(ready);
        }
    }

    /// Make sure a usable connection exists. Returns whether one was started.
    pub async fn ensure_ready(&self, options: EnsureReadyOptions) -> Result<bool, LifecycleError> {
        let settings = self.settings.current();
        let desired = DesiredConnection::resolve(&settings, options.query.as_ref());

        let mut state = self.state.lock().await;
        self.ensure_ready_locked(&mut state, desired, &options)
            .await
    }

    async fn ensure_ready_locked(
        &self,
        state: &mut Option<ActiveConnection>,
        desired: Result<DesiredConnection, LifecycleError>,
        options: &EnsureReadyOptions,
    ) -> Result<bool, LifecycleError> {
        if let Some(active) = state.as_ref() {
            let unchanged = match &desired {
                Ok(desired) => !active.desired.snapshot.requires_restart(&desired.snapshot),
                Err(_) => false,
            };
            if unchanged && !options.force {
                return Ok(false);
            }
            info!(
                component = "lifecycle",
                event = "connection.restart_requested",
                forced = options.force,
                preserve_handlers = options.preserve_handlers,
                generation = active.generation,
            );
            // Close first: if the new start fails there is no connection
            // at all, and callers fall back to a cold start. A restart that
            // keeps its handlers follows a dead transport, so there is
            // nothing left to interrupt.
            self.close_locked(state, options.preserve_handlers, !options.preserve_handlers)
                .await;
        }

        self.start_locked(state, desired?).await?;
        Ok(true)
    }

    /// Push live-updatable differences to the running connection, then
    /// restart once if anything else still differs.
    pub fn apply_dynamic_updates<'a>(
        &'a self,
        options: Option<&'a QueryOptions>,
        allow_restart: bool,
    ) -> BoxFuture<'a, Result<(), LifecycleError>> {
        async move {
            let settings = self.settings.current();
            let desired = DesiredConnection::resolve(&settings, options)?;

            let mut state = self.state.lock().await;
            let Some(active) = state.as_mut() else {
                return Ok(());
            };

            for field in active.desired.snapshot.live_differences(&desired.snapshot) {
                let result = match field {
                    LiveField::Model => {
                        active
                            .connection
                            .set_model(desired.snapshot.model.as_deref())
                            .await
                    }
                    LiveField::ThinkingTokens => {
                        active
                            .connection
                            .set_max_thinking_tokens(desired.snapshot.max_thinking_tokens)
                            .await
                    }
                    LiveField::PermissionMode => {
                        active
                            .connection
                            .set_permission_mode(desired.snapshot.permission_mode)
                            .await
                    }
                    LiveField::McpServers => {
                        active
                            .connection
                            .set_mcp_servers(&desired.mcp_servers)
                            .await
                    }
                };

                match result {
                    Ok(()) => {
                        active.desired.snapshot.adopt(field, &desired.snapshot);
                        match field {
                            LiveField::Model => self
                                .session()
                                .set_pending_model(desired.snapshot.model.clone()),
                            LiveField::McpServers => {
                                active.desired.mcp_servers = desired.mcp_servers.clone()
                            }
                            LiveField::ThinkingTokens | LiveField::PermissionMode => {}
                        }
                        debug!(
                            component = "lifecycle",
                            event = "connection.live_update",
                            field = ?field,
                        );
                    }
                    Err(e) => warn!(
                        component = "lifecycle",
                        event = "connection.live_update_failed",
                        field = ?field,
                        error = %e,
                        "Live update failed; leaving field stale"
                    ),
                }
            }

            if !active.desired.snapshot.requires_restart(&desired.snapshot) {
                return Ok(());
            }
            if !allow_restart {
                warn!(
                    component = "lifecycle",
                    event = "connection.restart_suppressed",
                    "Configuration still differs after restart"
                );
                return Ok(());
            }

            info!(
                component = "lifecycle",
                event = "connection.restart_for_config",
                generation = active.generation,
            );
            self.close_locked(&mut state, false, true).await;
            self.start_locked(&mut state, desired).await?;
            drop(state);

            self.apply_dynamic_updates(options, false).await
        }
        .boxed()
    }

    /// Hand a message to the running connection.
    pub async fn enqueue(&self, message: OutboundMessage) -> Result<EnqueueOutcome, LifecycleError> {
        let state = self.state.lock().await;
        let active = state.as_ref().ok_or(LifecycleError::NotReady)?;
        Ok(active.channel.enqueue(message)?)
    }

    /// Ask the running connection to stop its current turn.
    pub async fn interrupt(&self) {
        let connection = match self.state.lock().await.as_ref() {
            Some(active) => active.connection.clone(),
            None => return,
        };
        match tokio::time::timeout(INTERRUPT_GRACE, connection.interrupt()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                component = "lifecycle",
                event = "connection.interrupt_failed",
                error = %e,
            ),
            Err(_) => warn!(
                component = "lifecycle",
                event = "connection.interrupt_timeout",
            ),
        }
    }

    pub async fn supported_commands(&self) -> Result<Vec<SlashCommandInfo>, LifecycleError> {
        let connection = match self.state.lock().await.as_ref() {
            Some(active) => active.connection.clone(),
            None => return Err(LifecycleError::NotReady),
        };
        Ok(connection.supported_commands().await?)
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state, false, true).await;
    }

    async fn start_locked(
        &self,
        state: &mut Option<ActiveConnection>,
        desired: DesiredConnection,
    ) -> Result<(), LifecycleError> {
        let channel = MessageChannel::new(self.diagnostics.clone());
        let resume = self.session().session_id().map(str::to_string);
        if let Some(session_id) = resume.as_deref() {
            channel.set_session_id(session_id);
        }

        let abort = CancellationToken::new();
        let config = desired.launch_config(resume.clone(), self.gate.clone(), abort.clone());
        let launched = match self.launcher.launch(config, channel.stream()).await {
            Ok(launched) => launched,
            Err(e) => {
                warn!(
                    component = "lifecycle",
                    event = "connection.start_failed",
                    error = %e,
                );
                abort.cancel();
                channel.close();
                self.set_ready(false);
                return Err(LifecycleError::LaunchFailed(e));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(consume_events(
            self.weak_self.clone(),
            generation,
            launched.events,
            channel.clone(),
            abort.clone(),
        ));

        info!(
            component = "lifecycle",
            event = "connection.started",
            generation,
            resume = ?resume,
            model = ?desired.snapshot.model,
            cwd = %desired.cwd.display(),
        );

        *state = Some(ActiveConnection {
            generation,
            connection: launched.connection,
            channel,
            desired,
            abort,
        });
        self.set_ready(true);
        Ok(())
    }

    async fn close_locked(
        &self,
        state: &mut Option<ActiveConnection>,
        preserve_handlers: bool,
        graceful: bool,
    ) {
        let Some(active) = state.take() else {
            return;
        };

        active.channel.close();
        if graceful && self.router.is_active() {
            let interrupted =
                tokio::time::timeout(INTERRUPT_GRACE, active.connection.interrupt()).await;
            if !matches!(interrupted, Ok(Ok(()))) {
                debug!(
                    component = "lifecycle",
                    event = "connection.interrupt_incomplete",
                    generation = active.generation,
                );
            }
        }
        active.abort.cancel();
        active.connection.abort();

        if !preserve_handlers {
            self.router.fail_active("Agent connection closed");
        }
        self.set_ready(false);

        info!(
            component = "lifecycle",
            event = "connection.closed",
            generation = active.generation,
            preserve_handlers,
        );
    }

    fn handle_transport_failure(
        self: Arc<Self>,
        generation: u64,
        error: ConnectorError,
    ) -> BoxFuture<'static, ()> {
        async move {
            let mut state = self.state.lock().await;
            let previous = match state.as_ref() {
                Some(active) if active.generation == generation => active.desired.clone(),
                _ => {
                    debug!(
                        component = "lifecycle",
                        event = "connection.stale_failure",
                        generation,
                    );
                    return;
                }
            };

            let message = error.to_string();
            warn!(
                component = "lifecycle",
                event = "connection.transport_failed",
                generation,
                error = %message,
            );

            if error.is_session_expired() {
                // Resuming again would fail the same way
                self.session().invalidate_session();
                self.router.fail_active(&message);
                self.close_locked(&mut state, false, false).await;
                self.reconnect_best_effort(&mut state).await;
                return;
            }

            match self.router.on_transport_failure(&message) {
                TransportOutcome::Replay(outbound) => {
                    let restart = EnsureReadyOptions {
                        force: true,
                        preserve_handlers: true,
                        query: None,
                    };
                    match self
                        .ensure_ready_locked(&mut state, Ok(previous), &restart)
                        .await
                    {
                        Ok(_) => {
                            let enqueued = state
                                .as_ref()
                                .map(|active| active.channel.enqueue(outbound));
                            if !matches!(enqueued, Some(Ok(_))) {
                                self.router.fail_active(&message);
                            }
                        }
                        Err(e) => {
                            if e.is_session_expired() {
                                self.session().invalidate_session();
                            }
                            self.router.fail_active(&e.to_string());
                        }
                    }
                }
                TransportOutcome::Surfaced => {
                    self.close_locked(&mut state, false, false).await;
                    self.reconnect_best_effort(&mut state).await;
                }
                TransportOutcome::Idle => {
                    self.close_locked(&mut state, false, false).await;
                }
            }
        }
        .boxed()
    }

    /// Prepare a connection for the next turn; nobody is waiting on it.
    async fn reconnect_best_effort(&self, state: &mut Option<ActiveConnection>) {
        let settings = self.settings.current();
        let result = match DesiredConnection::resolve(&settings, None) {
            Ok(desired) => self.start_locked(state, desired).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(
                component = "lifecycle",
                event = "connection.reconnect_failed",
                error = %e,
            );
        }
    }
}

async fn consume_events(
    manager: Weak<ConnectionManager>,
    generation: u64,
    mut events: EventStream,
    channel: MessageChannel,
    abort: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            item = events.recv() => item,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match item {
            Some(Ok(event)) => manager.router.route(event, &manager.session, &channel),
            Some(Err(e)) => {
                manager.handle_transport_failure(generation, e).await;
                break;
            }
            None => {
                let closed = ConnectorError::TransportClosed("event stream ended".to_string());
                manager.handle_transport_failure(generation, closed).await;
                break;
            }
        }
    }
    debug!(
        component = "lifecycle",
        event = "connection.consumer_stopped",
        generation,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, SharedSettings};
    use crate::permission::ApproveAll;
    use crate::testing::{eventually, MockLauncher};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use vaultpilot_protocol::{AgentEvent, StreamChunk};

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: Arc<SharedSettings>,
        launcher: Arc<MockLauncher>,
        manager: Arc<ConnectionManager>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("claude");
        std::fs::write(&bin, "").unwrap();
        let settings = Arc::new(SharedSettings::new(Settings {
            vault_path: Some(dir.path().to_path_buf()),
            cli_path: Some(bin),
            ..Default::default()
        }));
        let launcher = Arc::new(MockLauncher::new());
        let gate = Arc::new(PermissionGate::new(settings.clone(), Arc::new(ApproveAll)));
        let manager = ConnectionManager::new(
            launcher.clone(),
            settings.clone(),
            gate,
            Arc::new(|_: &str| {}),
        );
        Fixture {
            _dir: dir,
            settings,
            launcher,
            manager,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn starts_once_and_reuses() {
        let f = fixture();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        f.manager.subscribe_readiness(Arc::new(move |ready| {
            if ready {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        assert!(f.manager.ensure_ready(Default::default()).await.unwrap());
        assert!(!f.manager.ensure_ready(Default::default()).await.unwrap());
        assert_eq!(f.launcher.launch_count(), 1);
        assert!(f.manager.is_ready());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_closes_before_starting() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();
        let first = f.launcher.handle(0);

        f.manager
            .ensure_ready(EnsureReadyOptions::forced())
            .await
            .unwrap();
        assert!(first.is_aborted());
        assert_eq!(f.launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn lost_vault_degrades_to_no_connection() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();

        f.settings
            .update(|s| s.vault_path = Some("/nonexistent/vault".into()));
        let result = f.manager.ensure_ready(Default::default()).await;
        assert!(matches!(result, Err(LifecycleError::NoWorkingDirectory)));
        assert!(!f.manager.is_ready());
        assert!(f.launcher.handle(0).is_aborted());
    }

    #[tokio::test]
    async fn model_change_is_applied_live() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();

        let options = QueryOptions {
            model: Some("opus".into()),
            ..Default::default()
        };
        f.manager
            .apply_dynamic_updates(Some(&options), true)
            .await
            .unwrap();

        assert_eq!(f.launcher.launch_count(), 1);
        assert!(f.launcher.calls().contains(&"set_model:opus".to_string()));
        assert_eq!(f.manager.session().pending_model(), Some("opus"));
    }

    #[tokio::test]
    async fn restart_only_field_triggers_one_restart() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();

        f.settings
            .update(|s| s.system_prompt = "Answer in French.".into());
        f.manager.apply_dynamic_updates(None, true).await.unwrap();

        assert_eq!(f.launcher.launch_count(), 2);
        assert_eq!(
            f.launcher.launch_config(1).system_prompt.as_deref(),
            Some("Answer in French.")
        );
    }

    #[tokio::test]
    async fn failed_live_update_restarts_once() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();
        f.launcher.fail_live_updates(true);

        let options = QueryOptions {
            model: Some("opus".into()),
            ..Default::default()
        };
        f.manager
            .apply_dynamic_updates(Some(&options), true)
            .await
            .unwrap();

        assert_eq!(f.launcher.launch_count(), 2);
        assert_eq!(f.launcher.launch_config(1).model.as_deref(), Some("opus"));
    }

    #[tokio::test]
    async fn crash_before_output_is_replayed_once() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = OutboundMessage::text("summarize");
        f.manager.router().register(tx, outbound.clone()).unwrap();
        f.manager.enqueue(outbound).await.unwrap();

        let first = f.launcher.handle(0);
        assert_eq!(first.next_input().await.unwrap().content.text(), "summarize");
        first.fail("broken pipe").await;

        eventually(|| f.launcher.launch_count() == 2).await;
        let second = f.launcher.handle(1);
        assert_eq!(second.next_input().await.unwrap().content.text(), "summarize");
        assert!(drain(&mut rx).is_empty());
        assert_eq!(f.launcher.calls(), vec!["abort"]);

        second.fail("broken pipe").await;
        eventually(|| !f.manager.router().is_active()).await;
        assert_eq!(
            drain(&mut rx),
            vec![StreamChunk::error("Agent connection closed: broken pipe")]
        );
    }

    #[tokio::test]
    async fn forced_restart_can_keep_handlers() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.manager
            .router()
            .register(tx, OutboundMessage::text("x"))
            .unwrap();

        let started = f
            .manager
            .ensure_ready(EnsureReadyOptions {
                force: true,
                preserve_handlers: true,
                query: None,
            })
            .await
            .unwrap();

        assert!(started);
        assert_eq!(f.launcher.launch_count(), 2);
        assert!(f.manager.router().is_active());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(f.launcher.calls(), vec!["abort"]);
    }

    #[tokio::test]
    async fn crash_after_output_is_surfaced_and_reconnects() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = OutboundMessage::text("go");
        f.manager.router().register(tx, outbound.clone()).unwrap();
        f.manager.enqueue(outbound).await.unwrap();

        let first = f.launcher.handle(0);
        first.next_input().await.unwrap();
        first
            .emit(AgentEvent::TextDelta {
                text: "partial".into(),
            })
            .await;
        first.fail("exited").await;

        eventually(|| f.launcher.launch_count() == 2).await;
        let chunks = drain(&mut rx);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], StreamChunk::Error { .. }));
        assert!(f.manager.is_ready());
    }

    #[tokio::test]
    async fn close_fails_pending_handlers() {
        let f = fixture();
        f.manager.ensure_ready(Default::default()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.manager
            .router()
            .register(tx, OutboundMessage::text("x"))
            .unwrap();

        f.manager.close().await;
        assert!(!f.manager.is_ready());
        assert_eq!(
            drain(&mut rx),
            vec![StreamChunk::error("Agent connection closed")]
        );
        assert!(f.launcher.calls().contains(&"interrupt".to_string()));
        assert!(matches!(
            f.manager.enqueue(OutboundMessage::text("late")).await,
            Err(LifecycleError::NotReady)
        ));
    }

    #[tokio::test]
    async fn expired_session_on_transport_invalidates() {
        let f = fixture();
        f.manager.session().capture_session("old", None);
        f.manager.ensure_ready(Default::default()).await.unwrap();
        assert_eq!(
            f.launcher.launch_config(0).resume_session_id.as_deref(),
            Some("old")
        );

        f.launcher
            .handle(0)
            .fail("No conversation found with session ID: old")
            .await;
        eventually(|| f.launcher.launch_count() == 2).await;

        assert!(f.manager.session().consume_invalidation());
        assert_eq!(f.launcher.launch_config(1).resume_session_id, None);
    }
}
