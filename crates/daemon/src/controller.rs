//! Bridge controller wiring the shell to a chat transport.
//!
//! The [`BridgeController`] owns the shell for the lifetime of the bridge.
//! It runs two loops:
//!
//! - the transport's event loop ([`chat_protocol::listen`]), which feeds
//!   messages through the [`InputRouter`] into the shell and admits invited
//!   rooms;
//! - the output path, where an [`OutputAggregator`] task batches terminal
//!   output and a relay task strips, splits and broadcasts each chunk.
//!
//! Transient transport failures are retried after a fixed backoff while the
//! shell keeps running. The bridge stops when shutdown is requested, when
//! the shell exits, or on a fatal error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chat_protocol::{
    listen, BoxFuture, ChatTransport, EventHandler, HandlerError, InviteEvent, MessageEvent,
    TransportError, TransportSession,
};
use futures_util::future::{FusedFuture, FutureExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AuthorizationPolicy, BroadcastSet};
use crate::config::Config;
use crate::filter;
use crate::router::{CommandGrammar, InputRouter, RouterError};
use crate::session::{FinishReason, OutputAggregator, OutputChunk, PtyError, PtyOutput, PtyProcess};

/// Chunks buffered between the aggregator and the relay.
const CHUNK_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the bridge event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long pending output may take to drain during shutdown.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that end the bridge abnormally.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The transport failed in a way reconnecting cannot fix.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Writing to the shell failed.
    #[error("shell error: {0}")]
    Pty(#[from] PtyError),

    /// The output task stopped unexpectedly.
    #[error("output task failed: {0}")]
    OutputTask(String),
}

/// Why the bridge stopped normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested.
    Shutdown,
    /// The shell exited.
    ChildExited,
}

impl StopReason {
    /// Process exit status for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            StopReason::Shutdown => 0,
            StopReason::ChildExited => 1,
        }
    }
}

/// Bridge lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Authenticating with the transport.
    Connecting,
    /// Receiving events and relaying output.
    Listening,
    /// Waiting out the reconnect backoff.
    Disconnected,
    /// Stopping the shell and draining output.
    ShuttingDown,
    /// Finished.
    Stopped,
}

/// Events emitted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Lifecycle state changed.
    StateChanged(BridgeState),
    /// A connection attempt started (1-based).
    Connecting { attempt: u32 },
    /// A room was added to the broadcast set.
    RoomAdmitted { room_id: String },
    /// A chunk of output was sent.
    ChunkRelayed { rooms: usize, bytes: usize },
}

/// Settings the controller reads from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Delay before reconnecting after a transient failure.
    pub reconnect_backoff: Duration,
    /// Output quiet window.
    pub quiet_window: Duration,
    /// Longest message sent in one piece.
    pub max_message_bytes: usize,
    /// Attach an HTML body to relayed output.
    pub html: bool,
    /// Join rooms on invitation from allowed senders.
    pub admit_invites: bool,
    /// Rooms joined at startup.
    pub rooms: Vec<String>,
}

impl BridgeSettings {
    /// Extracts the controller's settings from the full configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect_backoff: config.bridge.reconnect_backoff(),
            quiet_window: config.output.quiet_window(),
            max_message_bytes: config.output.max_message_bytes,
            html: config.output.html,
            admit_invites: config.auth.admit_invites,
            rooms: config.bridge.rooms.clone(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Runs one bridge between a shell and a chat transport.
pub struct BridgeController<T: ChatTransport> {
    settings: BridgeSettings,
    transport: Arc<T>,
    pty: Arc<PtyProcess>,
    /// Taken by `run`.
    output: Option<PtyOutput>,
    policy: Arc<AuthorizationPolicy>,
    grammar: CommandGrammar,
    rooms: BroadcastSet,
    state: Arc<RwLock<BridgeState>>,
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<BridgeEvent>,
}

impl<T: ChatTransport + 'static> BridgeController<T> {
    /// Creates a controller for an already spawned shell.
    pub fn new(
        settings: BridgeSettings,
        transport: Arc<T>,
        (pty, output): (PtyProcess, PtyOutput),
        policy: AuthorizationPolicy,
        grammar: CommandGrammar,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            transport,
            pty: Arc::new(pty),
            output: Some(output),
            policy: Arc::new(policy),
            grammar,
            rooms: BroadcastSet::new(),
            state: Arc::new(RwLock::new(BridgeState::Connecting)),
            shutdown: CancellationToken::new(),
            event_tx,
        }
    }

    /// Token that stops the bridge when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe to bridge events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }

    /// Rooms output is relayed to.
    pub fn rooms(&self) -> BroadcastSet {
        self.rooms.clone()
    }

    /// The bridged shell.
    pub fn pty(&self) -> Arc<PtyProcess> {
        Arc::clone(&self.pty)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    /// Runs the bridge until shutdown, shell exit or a fatal error.
    ///
    /// The shell is terminated before this returns, whatever the outcome.
    pub async fn run(mut self) -> Result<StopReason, BridgeError> {
        let output = self
            .output
            .take()
            .ok_or_else(|| BridgeError::OutputTask("shell output already consumed".to_string()))?;
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let aggregator = OutputAggregator::new(output, self.settings.quiet_window);
        let mut aggregator_task = tokio::spawn(aggregator.run(chunk_tx, self.shutdown.clone())).fuse();

        let relay = OutputRelay {
            transport: Arc::clone(&self.transport),
            rooms: self.rooms.clone(),
            max_message_bytes: self.settings.max_message_bytes,
            html: self.settings.html,
            retry_backoff: self.settings.reconnect_backoff,
            shutdown: self.shutdown.clone(),
            event_tx: self.event_tx.clone(),
        };
        let relay_task = tokio::spawn(relay.run(chunk_rx));

        let outcome = self.event_loop(&mut aggregator_task).await;

        self.set_state(BridgeState::ShuttingDown).await;
        self.shutdown.cancel();

        match &outcome {
            Ok(reason) => info!(reason = ?reason, "Bridge stopping"),
            Err(e) => error!(error = %e, "Bridge stopping after fatal error"),
        }

        if !aggregator_task.is_terminated() {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut aggregator_task).await;
        }

        let pty = Arc::clone(&self.pty);
        match tokio::task::spawn_blocking(move || pty.terminate()).await {
            Ok(Ok(status)) => debug!(status = ?status, "Shell stopped"),
            Ok(Err(PtyError::AlreadyTerminated)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to terminate shell"),
            Err(e) => warn!(error = %e, "Terminate task failed"),
        }

        // The terminal is closed now, so the aggregator reaches EOF.
        if !aggregator_task.is_terminated() {
            let _ = aggregator_task.await;
        }
        match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, relay_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Relay task failed"),
            Err(_) => warn!("Timed out relaying final output"),
        }

        self.set_state(BridgeState::Stopped).await;
        outcome
    }

    /// Connect/listen/backoff cycle. Returns once the bridge should stop.
    async fn event_loop<F>(&self, output_done: &mut F) -> Result<StopReason, BridgeError>
    where
        F: std::future::Future<Output = Result<FinishReason, JoinError>> + FusedFuture + Unpin,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.set_state(BridgeState::Connecting).await;
            self.emit(BridgeEvent::Connecting { attempt });
            info!(attempt, "Connecting to chat transport");

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(StopReason::Shutdown),
                finish = &mut *output_done => return output_outcome(finish),
                result = self.transport.connect() => result,
            };

            let failure = match connected {
                Ok(session) => {
                    self.admit_initial_rooms(&session).await;
                    self.set_state(BridgeState::Listening).await;
                    info!(user_id = %session.user_id, rooms = self.rooms.len(), "Listening for commands");

                    let handler = BridgeHandler {
                        router: InputRouter::new(
                            Arc::clone(&self.policy),
                            self.grammar.clone(),
                            Arc::clone(&self.pty),
                        )
                        .with_own_user(session.user_id.clone()),
                        transport: Arc::clone(&self.transport),
                        policy: Arc::clone(&self.policy),
                        rooms: self.rooms.clone(),
                        admit_invites: self.settings.admit_invites,
                        event_tx: self.event_tx.clone(),
                        fatal: Mutex::new(None),
                    };

                    let result = tokio::select! {
                        result = listen(self.transport.as_ref(), &handler, &self.shutdown) => result,
                        finish = &mut *output_done => return output_outcome(finish),
                    };

                    match result {
                        Ok(()) => return Ok(StopReason::Shutdown),
                        Err(TransportError::Handler(e)) => {
                            return match handler.take_fatal() {
                                Some(PtyError::ChildExited) => Ok(StopReason::ChildExited),
                                Some(pty_error) => Err(BridgeError::Pty(pty_error)),
                                None => Err(BridgeError::Transport(TransportError::Handler(e))),
                            };
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if failure.is_closed() {
                info!(reason = %failure, "Transport closed");
                return Ok(StopReason::Shutdown);
            }
            if !failure.is_transient() {
                return Err(BridgeError::Transport(failure));
            }

            warn!(
                error = %failure,
                backoff = ?self.settings.reconnect_backoff,
                "Transport failed, reconnecting"
            );
            self.set_state(BridgeState::Disconnected).await;

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(StopReason::Shutdown),
                finish = &mut *output_done => return output_outcome(finish),
                _ = tokio::time::sleep(self.settings.reconnect_backoff) => {}
            }
        }
    }

    /// Adds configured and already joined rooms to the broadcast set,
    /// joining configured rooms the account is not in yet.
    async fn admit_initial_rooms(&self, session: &TransportSession) {
        for room_id in &self.settings.rooms {
            if !session.joined_rooms.contains(room_id) {
                if let Err(e) = self.transport.join(room_id).await {
                    warn!(room_id = %room_id, error = %e, "Failed to join configured room");
                    continue;
                }
            }
            self.admit(room_id);
        }
        for room_id in &session.joined_rooms {
            self.admit(room_id);
        }
    }

    fn admit(&self, room_id: &str) {
        if self.rooms.insert(room_id) {
            debug!(room_id, "Room added to broadcast set");
            self.emit(BridgeEvent::RoomAdmitted {
                room_id: room_id.to_string(),
            });
        }
    }

    async fn set_state(&self, new_state: BridgeState) {
        {
            let mut state = self.state.write().await;
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        self.emit(BridgeEvent::StateChanged(new_state));
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn output_outcome(finish: Result<FinishReason, JoinError>) -> Result<StopReason, BridgeError> {
    match finish {
        Ok(FinishReason::ChildExited) => {
            info!("Shell exited");
            Ok(StopReason::ChildExited)
        }
        Ok(FinishReason::Shutdown) => Ok(StopReason::Shutdown),
        Ok(FinishReason::SinkClosed) => Err(BridgeError::OutputTask("relay stopped".to_string())),
        Err(e) => Err(BridgeError::OutputTask(e.to_string())),
    }
}

/// Strips, splits and broadcasts output chunks.
struct OutputRelay<T: ChatTransport> {
    transport: Arc<T>,
    rooms: BroadcastSet,
    max_message_bytes: usize,
    html: bool,
    /// Delay between attempts after a transient send failure.
    retry_backoff: Duration,
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<BridgeEvent>,
}

impl<T: ChatTransport> OutputRelay<T> {
    /// Relays every chunk until the aggregator stops.
    async fn run(self, mut chunks: mpsc::Receiver<OutputChunk>) {
        while let Some(chunk) = chunks.recv().await {
            self.relay(&chunk).await;
        }
    }

    async fn relay(&self, chunk: &OutputChunk) {
        let text = filter::strip(&chunk.text());
        if filter::is_blank(&text) {
            trace!(bytes = chunk.data.len(), "Skipping blank output");
            return;
        }

        let targets = self.rooms.snapshot();
        if targets.is_empty() {
            debug!(bytes = text.len(), "No rooms to relay output to");
            return;
        }

        let mut delivered = vec![true; targets.len()];
        for part in filter::split_message(&text, self.max_message_bytes) {
            let rendered = self.html.then(|| filter::render_html(part));
            for (room_id, ok) in targets.iter().zip(delivered.iter_mut()) {
                if !self.deliver(room_id, part, rendered.as_deref()).await {
                    *ok = false;
                }
            }
        }

        let rooms = delivered.iter().filter(|ok| **ok).count();
        if rooms > 0 {
            let _ = self.event_tx.send(BridgeEvent::ChunkRelayed {
                rooms,
                bytes: text.len(),
            });
        }
    }

    /// Sends one part to one room. Transient failures are retried after the
    /// backoff until the send succeeds or shutdown is requested.
    async fn deliver(&self, room_id: &str, part: &str, html: Option<&str>) -> bool {
        loop {
            let error = match self.transport.send(room_id, part, html).await {
                Ok(()) => return true,
                Err(e) => e,
            };

            if !error.is_transient() {
                warn!(room_id = %room_id, error = %error, "Failed to relay output, dropping it");
                return false;
            }
            if self.shutdown.is_cancelled() {
                warn!(room_id = %room_id, error = %error, "Failed to relay output during shutdown");
                return false;
            }

            warn!(
                room_id = %room_id,
                error = %error,
                backoff = ?self.retry_backoff,
                "Failed to relay output, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_backoff) => {}
            }
        }
    }
}

/// Event callbacks for one connection.
struct BridgeHandler<T: ChatTransport> {
    router: InputRouter<PtyProcess>,
    transport: Arc<T>,
    policy: Arc<AuthorizationPolicy>,
    rooms: BroadcastSet,
    admit_invites: bool,
    event_tx: broadcast::Sender<BridgeEvent>,
    /// Write error that ended the listen loop.
    fatal: Mutex<Option<PtyError>>,
}

impl<T: ChatTransport> BridgeHandler<T> {
    fn take_fatal(&self) -> Option<PtyError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl<T: ChatTransport> EventHandler for BridgeHandler<T> {
    fn on_message<'a>(&'a self, event: &'a MessageEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            match self.router.route(&event.sender, &event.room_id, &event.body) {
                Ok(_) => Ok(()),
                Err(RouterError::Pty(e)) => {
                    error!(sender = %event.sender, error = %e, "Failed to write to shell");
                    let message = e.to_string();
                    *self.fatal.lock().unwrap_or_else(|e| e.into_inner()) = Some(e);
                    Err(HandlerError::Fatal(message))
                }
            }
        })
    }

    fn on_invite<'a>(&'a self, event: &'a InviteEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if !self.admit_invites {
                debug!(room_id = %event.room_id, "Invite admission disabled, ignoring invite");
                return Ok(());
            }
            if !self.policy.is_allowed(&event.sender) {
                info!(sender = %event.sender, room_id = %event.room_id, "Ignoring invite from unauthorized sender");
                return Ok(());
            }

            if let Err(e) = self.transport.join(&event.room_id).await {
                warn!(room_id = %event.room_id, error = %e, "Failed to join invited room");
                return Ok(());
            }

            if self.rooms.insert(event.room_id.clone()) {
                info!(sender = %event.sender, room_id = %event.room_id, "Joined room on invite");
                let _ = self.event_tx.send(BridgeEvent::RoomAdmitted {
                    room_id: event.room_id.clone(),
                });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use chat_protocol::{InboundEvent, Result as TransportResult};
    use std::collections::VecDeque;

    const ALICE: &str = "@alice:example.org";

    /// Transport replaying scripted connect results and event batches.
    ///
    /// Once the batches run out it cancels `done` (unless `linger` is set)
    /// and blocks forever.
    #[derive(Default)]
    struct ScriptedTransport {
        linger: bool,
        connect_errors: Mutex<VecDeque<TransportError>>,
        batches: Mutex<VecDeque<TransportResult<Vec<InboundEvent>>>>,
        joined_rooms: Vec<String>,
        connects: Mutex<Vec<Option<u32>>>,
        joins: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
        send_errors: Mutex<VecDeque<TransportError>>,
        pty: Mutex<Option<Arc<PtyProcess>>>,
        done: CancellationToken,
    }

    impl ScriptedTransport {
        fn with_batches(batches: Vec<TransportResult<Vec<InboundEvent>>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                ..Default::default()
            }
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn connect(&self) -> BoxFuture<'_, TransportResult<TransportSession>> {
            let pid = self.pty.lock().unwrap().as_ref().and_then(|p| p.pid());
            self.connects.lock().unwrap().push(pid);
            let next = self.connect_errors.lock().unwrap().pop_front();
            Box::pin(async move {
                match next {
                    Some(e) => Err(e),
                    None => Ok(TransportSession {
                        user_id: "@bridge:example.org".to_string(),
                        joined_rooms: self.joined_rooms.clone(),
                    }),
                }
            })
        }

        fn next_events(&self) -> BoxFuture<'_, TransportResult<Vec<InboundEvent>>> {
            let next = self.batches.lock().unwrap().pop_front();
            Box::pin(async move {
                match next {
                    Some(batch) => batch,
                    None => {
                        if !self.linger {
                            self.done.cancel();
                        }
                        std::future::pending().await
                    }
                }
            })
        }

        fn send<'a>(&'a self, room_id: &'a str, body: &'a str, _html: Option<&'a str>) -> BoxFuture<'a, TransportResult<()>> {
            if let Some(e) = self.send_errors.lock().unwrap().pop_front() {
                return Box::pin(async move { Err(e) });
            }
            self.sent
                .lock()
                .unwrap()
                .push((room_id.to_string(), body.to_string()));
            Box::pin(async { Ok(()) })
        }

        fn join<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, TransportResult<()>> {
            self.joins.lock().unwrap().push(room_id.to_string());
            Box::pin(async { Ok(()) })
        }
    }

    fn relay(
        transport: &Arc<ScriptedTransport>,
        rooms: &[&str],
        max_message_bytes: usize,
        html: bool,
    ) -> (OutputRelay<ScriptedTransport>, broadcast::Receiver<BridgeEvent>) {
        let set = BroadcastSet::new();
        for room in rooms {
            set.insert(*room);
        }
        let (event_tx, event_rx) = broadcast::channel(8);
        let relay = OutputRelay {
            transport: Arc::clone(transport),
            rooms: set,
            max_message_bytes,
            html,
            retry_backoff: Duration::from_millis(10),
            shutdown: CancellationToken::new(),
            event_tx,
        };
        (relay, event_rx)
    }

    fn text_chunk(text: &str) -> OutputChunk {
        let now = std::time::SystemTime::now();
        OutputChunk {
            data: bytes::Bytes::from(text.to_string()),
            started_at: now,
            finished_at: now,
        }
    }

    fn settings() -> BridgeSettings {
        BridgeSettings {
            reconnect_backoff: Duration::from_millis(10),
            ..BridgeSettings::default()
        }
    }

    fn shell(args: &[&str]) -> (PtyProcess, PtyOutput) {
        let config = ShellConfig {
            command: "/bin/sh".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..ShellConfig::default()
        };
        PtyProcess::spawn(&config).unwrap()
    }

    /// Builds a controller whose shutdown follows `transport.done`.
    fn controller(
        transport: Arc<ScriptedTransport>,
        settings: BridgeSettings,
        shell: (PtyProcess, PtyOutput),
    ) -> BridgeController<ScriptedTransport> {
        let controller = BridgeController::new(
            settings,
            Arc::clone(&transport),
            shell,
            AuthorizationPolicy::new([ALICE]),
            CommandGrammar::default(),
        );
        *transport.pty.lock().unwrap() = Some(controller.pty());

        let done = transport.done.clone();
        let shutdown = controller.shutdown_token();
        tokio::spawn(async move {
            done.cancelled().await;
            shutdown.cancel();
        });
        controller
    }

    #[test]
    fn test_stop_reason_exit_codes() {
        assert_eq!(StopReason::Shutdown.exit_code(), 0);
        assert_eq!(StopReason::ChildExited.exit_code(), 1);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.bridge.reconnect_backoff_secs = 7;
        config.bridge.rooms = vec!["!r:hs".to_string()];
        config.output.html = false;

        let settings = BridgeSettings::from_config(&config);
        assert_eq!(settings.reconnect_backoff, Duration::from_secs(7));
        assert_eq!(settings.quiet_window, Duration::from_millis(100));
        assert_eq!(settings.rooms, vec!["!r:hs"]);
        assert!(!settings.html);
    }

    #[tokio::test]
    async fn test_reconnects_after_timeouts_with_same_shell() {
        let transport = Arc::new(ScriptedTransport::with_batches(vec![
            Err(TransportError::Timeout("sync".into())),
            Err(TransportError::Timeout("sync".into())),
            Err(TransportError::Connection("reset".into())),
        ]));
        let controller = controller(Arc::clone(&transport), settings(), shell(&[]));
        let pid = controller.pty().pid();
        let mut events = controller.subscribe();

        let reason = controller.run().await.unwrap();

        assert_eq!(reason, StopReason::Shutdown);
        let connects = transport.connects.lock().unwrap().clone();
        assert_eq!(connects.len(), 4);
        assert!(connects.iter().all(|p| *p == pid));

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BridgeEvent::Connecting { attempt } = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_connect_timeouts_are_retried() {
        let transport = Arc::new(ScriptedTransport {
            connect_errors: Mutex::new(VecDeque::from(vec![
                TransportError::Timeout("login".into()),
                TransportError::Connection("refused".into()),
            ])),
            ..Default::default()
        });
        let controller = controller(Arc::clone(&transport), settings(), shell(&[]));

        assert_eq!(controller.run().await.unwrap(), StopReason::Shutdown);
        assert_eq!(transport.connects.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let transport = Arc::new(ScriptedTransport {
            connect_errors: Mutex::new(VecDeque::from(vec![TransportError::Auth("M_FORBIDDEN".into())])),
            ..Default::default()
        });
        let controller = controller(Arc::clone(&transport), settings(), shell(&[]));
        let pty = controller.pty();

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, BridgeError::Transport(TransportError::Auth(_))));
        assert_eq!(transport.connects.lock().unwrap().len(), 1);
        assert!(!pty.is_running());
    }

    #[tokio::test]
    async fn test_closed_transport_is_shutdown() {
        let transport = Arc::new(ScriptedTransport::with_batches(vec![Err(TransportError::Closed(
            "stdin closed".into(),
        ))]));
        let controller = controller(Arc::clone(&transport), settings(), shell(&[]));

        assert_eq!(controller.run().await.unwrap(), StopReason::Shutdown);
        assert_eq!(transport.connects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shell_exit_stops_bridge() {
        // Lingers forever, so only the shell exit can stop it
        let transport = Arc::new(ScriptedTransport {
            linger: true,
            ..Default::default()
        });
        let controller = controller(Arc::clone(&transport), settings(), shell(&["-c", "exit 3"]));

        let reason = tokio::time::timeout(Duration::from_secs(10), controller.run())
            .await
            .expect("bridge did not stop")
            .unwrap();
        assert_eq!(reason, StopReason::ChildExited);
    }

    #[tokio::test]
    async fn test_invites_from_allowed_senders_are_admitted() {
        let transport = Arc::new(ScriptedTransport::with_batches(vec![Ok(vec![
            InboundEvent::invite(ALICE, "!ops:example.org"),
            InboundEvent::invite("@mallory:example.org", "!evil:example.org"),
        ])]));
        let controller = controller(Arc::clone(&transport), settings(), shell(&[]));
        let rooms = controller.rooms();

        controller.run().await.unwrap();

        assert_eq!(rooms.snapshot(), vec!["!ops:example.org"]);
        assert_eq!(*transport.joins.lock().unwrap(), vec!["!ops:example.org"]);
    }

    #[tokio::test]
    async fn test_invites_ignored_when_admission_disabled() {
        let transport = Arc::new(ScriptedTransport::with_batches(vec![Ok(vec![InboundEvent::invite(
            ALICE,
            "!ops:example.org",
        )])]));
        let settings = BridgeSettings {
            admit_invites: false,
            ..settings()
        };
        let controller = controller(Arc::clone(&transport), settings, shell(&[]));
        let rooms = controller.rooms();

        controller.run().await.unwrap();

        assert!(rooms.is_empty());
        assert!(transport.joins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initial_rooms_seed_broadcast_set() {
        let transport = Arc::new(ScriptedTransport {
            joined_rooms: vec!["!joined:example.org".to_string()],
            ..Default::default()
        });
        let settings = BridgeSettings {
            rooms: vec!["!configured:example.org".to_string(), "!joined:example.org".to_string()],
            ..settings()
        };
        let controller = controller(Arc::clone(&transport), settings, shell(&[]));
        let rooms = controller.rooms();

        controller.run().await.unwrap();

        assert_eq!(rooms.snapshot(), vec!["!configured:example.org", "!joined:example.org"]);
        assert_eq!(*transport.joins.lock().unwrap(), vec!["!configured:example.org"]);
    }

    #[tokio::test]
    async fn test_relay_strips_splits_and_broadcasts() {
        let transport = Arc::new(ScriptedTransport::default());
        let (relay, mut event_rx) = relay(&transport, &["!a:hs", "!b:hs"], 64, false);
        let (chunk_tx, chunk_rx) = mpsc::channel(4);

        chunk_tx.send(text_chunk("\x1b[0m   \r\n")).await.unwrap();
        chunk_tx
            .send(text_chunk("\x1b[1mline one\x1b[0m\r\nline two\r\n"))
            .await
            .unwrap();
        drop(chunk_tx);

        relay.run(chunk_rx).await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("!a:hs".to_string(), "line one\nline two\n".to_string()),
                ("!b:hs".to_string(), "line one\nline two\n".to_string()),
            ]
        );
        assert_eq!(
            event_rx.try_recv().unwrap(),
            BridgeEvent::ChunkRelayed { rooms: 2, bytes: 18 }
        );
    }

    #[tokio::test]
    async fn test_relay_splits_long_output() {
        let transport = Arc::new(ScriptedTransport::default());
        let (relay, _event_rx) = relay(&transport, &["!a:hs"], 64, true);
        let (chunk_tx, chunk_rx) = mpsc::channel(4);

        let text = "0123456789\n".repeat(10);
        chunk_tx.send(text_chunk(&text)).await.unwrap();
        drop(chunk_tx);

        relay.run(chunk_rx).await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, body)| body.len() <= 64));
        let joined: String = sent.into_iter().map(|(_, body)| body).collect();
        assert_eq!(joined, text);
    }

    #[tokio::test]
    async fn test_relay_retries_transient_send_failure() {
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .send_errors
            .lock()
            .unwrap()
            .push_back(TransportError::Timeout("homeserver unreachable".to_string()));
        let (relay, mut event_rx) = relay(&transport, &["!a:hs"], 1024, false);
        let (chunk_tx, chunk_rx) = mpsc::channel(4);

        chunk_tx.send(text_chunk("first output\n")).await.unwrap();
        chunk_tx.send(text_chunk("second output\n")).await.unwrap();
        drop(chunk_tx);

        relay.run(chunk_rx).await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("!a:hs".to_string(), "first output\n".to_string()),
                ("!a:hs".to_string(), "second output\n".to_string()),
            ]
        );
        assert_eq!(
            event_rx.try_recv().unwrap(),
            BridgeEvent::ChunkRelayed { rooms: 1, bytes: 13 }
        );
    }

    #[tokio::test]
    async fn test_relay_drops_output_on_permanent_failure() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.send_errors.lock().unwrap().push_back(TransportError::Api {
            status: 403,
            message: "M_FORBIDDEN".to_string(),
        });
        let (relay, mut event_rx) = relay(&transport, &["!a:hs", "!b:hs"], 1024, false);
        let (chunk_tx, chunk_rx) = mpsc::channel(4);

        chunk_tx.send(text_chunk("hello\n")).await.unwrap();
        drop(chunk_tx);

        relay.run(chunk_rx).await;

        // The first room refused the message; only the second got it.
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("!b:hs".to_string(), "hello\n".to_string())]);
        assert_eq!(
            event_rx.try_recv().unwrap(),
            BridgeEvent::ChunkRelayed { rooms: 1, bytes: 6 }
        );
    }

    #[tokio::test]
    async fn test_relay_reports_nothing_when_every_send_fails() {
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .send_errors
            .lock()
            .unwrap()
            .push_back(TransportError::Auth("M_UNKNOWN_TOKEN".to_string()));
        let (relay, mut event_rx) = relay(&transport, &["!a:hs"], 1024, false);
        let (chunk_tx, chunk_rx) = mpsc::channel(4);

        chunk_tx.send(text_chunk("lost\n")).await.unwrap();
        drop(chunk_tx);

        relay.run(chunk_rx).await;

        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_retry_stops_on_shutdown() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..1000 {
            transport
                .send_errors
                .lock()
                .unwrap()
                .push_back(TransportError::Connection("refused".to_string()));
        }
        let (relay, _event_rx) = relay(&transport, &["!a:hs"], 1024, false);
        let shutdown = relay.shutdown.clone();
        let (chunk_tx, chunk_rx) = mpsc::channel(4);

        chunk_tx.send(text_chunk("stuck\n")).await.unwrap();
        drop(chunk_tx);

        let task = tokio::spawn(relay.run(chunk_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("relay should stop retrying on shutdown")
            .unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
