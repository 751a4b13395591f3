//! Long-lived channels behind the tools pane: interactive terminals, build
//! jobs and log tails.

pub mod log_tail;
pub mod memory;
pub mod transport;
pub mod ws;

pub use transport::{Connector, Frame, SessionError, StreamTransport};

use deck_core::wire::{BuildRequest, ControlMessage, TerminalSize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Terminal,
    Build,
    Logs,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Terminal => "terminal",
            SessionKind::Build => "build",
            SessionKind::Logs => "logs",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// First message sent once the transport is up, before any user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Terminal(TerminalSize),
    Build(BuildRequest),
    None,
}

impl Handshake {
    fn frame(&self) -> Result<Option<Frame>, SessionError> {
        let text = match self {
            Handshake::Terminal(size) => serde_json::to_string(&ControlMessage::from(*size)),
            Handshake::Build(request) => serde_json::to_string(request),
            Handshake::None => return Ok(None),
        };
        text.map(|text| Some(Frame::Text(text)))
            .map_err(|err| SessionError::Protocol(err.to_string()))
    }
}

/// Where session output ends up.
pub trait OutputSink: Send {
    fn write(&mut self, bytes: &[u8]);
}

/// Output sink collecting everything into a shared buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
            .unwrap_or_default()
    }
}

impl OutputSink for BufferSink {
    fn write(&mut self, bytes: &[u8]) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(bytes);
        }
    }
}

pub struct StreamSession {
    kind: SessionKind,
    target: String,
    state: SessionState,
    handshake: Handshake,
    transport: Option<Box<dyn StreamTransport>>,
    sink: Option<Box<dyn OutputSink>>,
    size_observer: Option<watch::Receiver<TerminalSize>>,
    dims: Option<TerminalSize>,
    delivered: u64,
}

impl StreamSession {
    pub fn new(
        kind: SessionKind,
        target: impl Into<String>,
        handshake: Handshake,
        sink: Box<dyn OutputSink>,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            state: SessionState::Idle,
            handshake,
            transport: None,
            sink: Some(sink),
            size_observer: None,
            dims: None,
            delivered: 0,
        }
    }

    /// Panel size changes to forward while the session is open.
    pub fn with_size_observer(mut self, observer: watch::Receiver<TerminalSize>) -> Self {
        self.size_observer = Some(observer);
        self
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last dimensions sent to the remote side.
    pub fn dims(&self) -> Option<TerminalSize> {
        self.dims
    }

    /// Bytes handed to the output sink so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn observes_size(&self) -> bool {
        self.size_observer.is_some()
    }

    /// Connects and sends the handshake. Only valid from `Idle`.
    pub async fn open(&mut self, connector: &dyn Connector) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Protocol(format!(
                "cannot open a session that is {}",
                self.state
            )));
        }
        self.state = SessionState::Connecting;
        debug!(event = "session_connecting", kind = %self.kind, instance = %self.target);

        let mut transport = match connector.connect().await {
            Ok(transport) => transport,
            Err(err) => {
                self.fail(&err).await;
                return Err(err);
            }
        };
        let handshake = self.handshake.frame();
        let sent = match handshake {
            Ok(Some(frame)) => transport.send(frame).await,
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        self.transport = Some(transport);
        if let Err(err) = sent {
            self.fail(&err).await;
            return Err(err);
        }

        if let Handshake::Terminal(size) = &self.handshake {
            self.dims = Some(*size);
        }
        if let Some(observer) = self.size_observer.as_mut() {
            observer.borrow_and_update();
        }
        self.state = SessionState::Open;
        info!(event = "session_open", kind = %self.kind, instance = %self.target);
        Ok(())
    }

    /// Forwards operator input. Returns false when nothing was sent.
    pub async fn send_input(&mut self, bytes: &[u8]) -> bool {
        if self.state != SessionState::Open {
            return false;
        }
        let frame = match std::str::from_utf8(bytes) {
            Ok(text) => Frame::Text(text.to_string()),
            Err(_) => Frame::Binary(bytes.to_vec()),
        };
        self.send(frame).await
    }

    /// Sends new terminal dimensions. Dropped unless the session is open.
    pub async fn resize(&mut self, size: TerminalSize) -> bool {
        if self.state != SessionState::Open || self.kind != SessionKind::Terminal {
            debug!(event = "session_resize_dropped", kind = %self.kind, state = %self.state);
            return false;
        }
        if self.dims == Some(size) {
            return false;
        }
        let text = match serde_json::to_string(&ControlMessage::from(size)) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "session_resize_encode_failed", error = %err);
                return false;
            }
        };
        if self.send(Frame::Text(text)).await {
            self.dims = Some(size);
            return true;
        }
        false
    }

    /// Waits for the next inbound frame or size change and handles it.
    /// Returns whether the session is still open.
    pub async fn pump(&mut self) -> bool {
        match self.next_event().await {
            Some(event) => self.handle(event).await,
            None => false,
        }
    }

    /// Waits for the next inbound frame or size change without acting on it.
    /// Dropping the returned future loses nothing, so it can race other
    /// sources in a `select!`.
    async fn next_event(&mut self) -> Option<Pumped> {
        if self.state != SessionState::Open {
            return None;
        }
        let transport = self.transport.as_mut()?;
        let observer = self.size_observer.as_mut();
        Some(tokio::select! {
            frame = transport.recv() => Pumped::Frame(frame),
            size = next_size(observer) => Pumped::Resize(size),
        })
    }

    async fn handle(&mut self, event: Pumped) -> bool {
        match event {
            Pumped::Frame(None) => self.finish_remote("[CLOSED]", "connection closed").await,
            Pumped::Frame(Some(Ok(Frame::Text(text)))) => self.deliver(text.as_bytes()),
            Pumped::Frame(Some(Ok(Frame::Binary(bytes)))) => self.deliver(&bytes),
            Pumped::Frame(Some(Ok(Frame::Close(reason)))) => {
                let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                self.finish_remote("[CLOSED]", &reason).await;
            }
            Pumped::Frame(Some(Ok(Frame::End(reason)))) => {
                self.finish_remote("[ENDED]", &reason).await
            }
            Pumped::Frame(Some(Err(err))) => self.fail(&err).await,
            Pumped::Resize(size) => {
                self.resize(size).await;
            }
        }
        self.state == SessionState::Open
    }

    /// Explicit close. Closing a finished session does nothing.
    pub async fn close(&mut self) {
        match self.state {
            SessionState::Closed | SessionState::Errored => {}
            SessionState::Idle => {
                self.teardown().await;
                self.state = SessionState::Closed;
            }
            _ => {
                self.state = SessionState::Closing;
                self.teardown().await;
                self.state = SessionState::Closed;
                info!(event = "session_closed", kind = %self.kind, instance = %self.target);
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.send(frame).await {
            Ok(()) => true,
            Err(err) => {
                self.fail(&err).await;
                false
            }
        }
    }

    fn deliver(&mut self, bytes: &[u8]) {
        self.delivered += bytes.len() as u64;
        if let Some(sink) = self.sink.as_mut() {
            sink.write(bytes);
        }
    }

    fn marker(&mut self, label: &str, reason: &str) {
        let line = match self.kind {
            SessionKind::Terminal => format!("\r\n\x1b[31m{label}\x1b[0m {reason}\r\n"),
            SessionKind::Build | SessionKind::Logs => format!("\n{label} {reason}\n"),
        };
        if let Some(sink) = self.sink.as_mut() {
            sink.write(line.as_bytes());
        }
    }

    async fn finish_remote(&mut self, label: &str, reason: &str) {
        self.marker(label, reason);
        self.state = SessionState::Closing;
        self.teardown().await;
        self.state = SessionState::Closed;
        info!(event = "session_remote_closed", kind = %self.kind, instance = %self.target, reason);
    }

    async fn fail(&mut self, err: &SessionError) {
        if self.state.is_finished() {
            return;
        }
        self.marker("[ERROR]", &err.to_string());
        self.state = SessionState::Errored;
        self.teardown().await;
        warn!(event = "session_failed", kind = %self.kind, instance = %self.target, error = %err);
    }

    async fn teardown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.sink = None;
        self.size_observer = None;
        self.dims = None;
    }
}

enum Pumped {
    Frame(Option<Result<Frame, SessionError>>),
    Resize(TerminalSize),
}

async fn next_size(observer: Option<&mut watch::Receiver<TerminalSize>>) -> TerminalSize {
    match observer {
        Some(observer) => match observer.changed().await {
            Ok(()) => *observer.borrow_and_update(),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

enum Step {
    Command(Option<SessionCommand>),
    Event(Option<Pumped>),
}

enum SessionCommand {
    Input(Vec<u8>),
    Close,
}

/// Owner side of a spawned session. Dropping it closes the session.
pub struct SessionHandle {
    kind: SessionKind,
    target: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    resize: watch::Sender<TerminalSize>,
    task: JoinHandle<SessionState>,
}

impl SessionHandle {
    /// Spawns the task driving `session` and calls `on_finish` with its final
    /// state once it has been torn down.
    pub fn spawn<F>(session: StreamSession, connector: Arc<dyn Connector>, on_finish: F) -> Self
    where
        F: FnOnce(SessionState) + Send + 'static,
    {
        let kind = session.kind();
        let target = session.target().to_string();
        let initial = match &session.handshake {
            Handshake::Terminal(size) => *size,
            _ => TerminalSize::default(),
        };
        let (resize, observer) = watch::channel(initial);
        let session = if kind == SessionKind::Terminal {
            session.with_size_observer(observer)
        } else {
            session
        };
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let state = drive(session, connector, command_rx).await;
            on_finish(state);
            state
        });
        Self {
            kind,
            target,
            commands,
            resize,
            task,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn send_input(&self, bytes: Vec<u8>) -> bool {
        self.commands.send(SessionCommand::Input(bytes)).is_ok()
    }

    /// Latest panel size. Only the newest value matters.
    pub fn resize(&self, size: TerminalSize) {
        self.resize.send_replace(size);
    }

    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Closes the session and waits for its teardown.
    pub async fn shutdown(self) -> SessionState {
        self.close();
        match self.task.await {
            Ok(state) => state,
            Err(err) => {
                warn!(event = "session_task_failed", error = %err);
                SessionState::Errored
            }
        }
    }
}

async fn drive(
    mut session: StreamSession,
    connector: Arc<dyn Connector>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) -> SessionState {
    if session.open(connector.as_ref()).await.is_err() {
        return session.state();
    }
    while session.state() == SessionState::Open {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            event = session.next_event() => Step::Event(event),
        };
        match step {
            Step::Command(Some(SessionCommand::Input(bytes))) => {
                session.send_input(&bytes).await;
            }
            Step::Command(Some(SessionCommand::Close) | None) => session.close().await,
            Step::Event(Some(event)) => {
                session.handle(event).await;
            }
            Step::Event(None) => break,
        }
    }
    if !session.state().is_finished() {
        session.close().await;
    }
    session.state()
}

#[cfg(test)]
mod tests {
    use super::memory::{memory_pair, MemoryConnector};
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn terminal(sink: &BufferSink) -> StreamSession {
        StreamSession::new(
            SessionKind::Terminal,
            "7",
            Handshake::Terminal(TerminalSize { cols: 100, rows: 30 }),
            Box::new(sink.clone()),
        )
    }

    fn frame_json(frame: Option<Frame>) -> serde_json::Value {
        match frame {
            Some(Frame::Text(text)) => serde_json::from_str(&text).expect("json frame"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_precedes_input() {
        let (transport, mut remote) = memory_pair();
        let connector = MemoryConnector::new(transport);
        let sink = BufferSink::default();
        let mut session = terminal(&sink);

        assert!(!session.send_input(b"ls\r").await);
        session.open(&connector).await.expect("open");
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.send_input(b"ls\r").await);

        assert_eq!(
            frame_json(remote.next_sent().await),
            json!({"type": "resize", "cols": 100, "rows": 30})
        );
        assert_eq!(remote.next_sent().await, Some(Frame::Text("ls\r".to_string())));
        assert_eq!(session.dims(), Some(TerminalSize { cols: 100, rows: 30 }));
    }

    #[tokio::test]
    async fn resize_only_while_open() {
        let (transport, mut remote) = memory_pair();
        let connector = MemoryConnector::new(transport);
        let sink = BufferSink::default();
        let mut session = terminal(&sink);

        assert!(!session.resize(TerminalSize { cols: 90, rows: 20 }).await);
        session.open(&connector).await.expect("open");
        let _handshake = remote.next_sent().await;

        let size = TerminalSize { cols: 90, rows: 20 };
        assert!(session.resize(size).await);
        assert!(!session.resize(size).await);
        assert_eq!(
            frame_json(remote.next_sent().await),
            json!({"type": "resize", "cols": 90, "rows": 20})
        );

        session.close().await;
        assert!(!session.resize(TerminalSize { cols: 10, rows: 5 }).await);
        assert!(remote.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn remote_close_appends_marker_and_cleans_up() {
        let (transport, remote) = memory_pair();
        let connector = MemoryConnector::new(transport);
        let sink = BufferSink::default();
        let mut session = StreamSession::new(
            SessionKind::Build,
            "job",
            Handshake::Build(BuildRequest {
                preset: "cuda".into(),
                ..BuildRequest::default()
            }),
            Box::new(sink.clone()),
        );
        session.open(&connector).await.expect("open");

        remote.push_text("step 1\n");
        remote.push(Frame::Close(Some("build finished".into())));
        assert!(session.pump().await);
        assert!(!session.pump().await);

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(sink.contents(), "step 1\n\n[CLOSED] build finished\n");
        assert_eq!(session.delivered(), 7);
        assert!(!session.has_sink());
        assert!(session.dims().is_none());
    }

    #[tokio::test]
    async fn transport_failure_errors_the_session() {
        let (transport, remote) = memory_pair();
        let connector = MemoryConnector::new(transport);
        let sink = BufferSink::default();
        let mut session = StreamSession::new(SessionKind::Logs, "3", Handshake::None, Box::new(sink.clone()));
        session.open(&connector).await.expect("open");

        remote.fail("connection reset");
        assert!(!session.pump().await);
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(sink.contents(), "\n[ERROR] connection reset\n");

        session.close().await;
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn refused_connect_is_an_error_marker() {
        let connector = MemoryConnector::refusing("503 busy");
        let sink = BufferSink::default();
        let mut session = terminal(&sink);
        assert!(session.open(&connector).await.is_err());
        assert_eq!(session.state(), SessionState::Errored);
        assert!(sink.contents().contains("[ERROR]"));
        assert!(session.open(&connector).await.is_err());
    }

    #[tokio::test]
    async fn close_twice_matches_close_once() {
        let (transport, _remote) = memory_pair();
        let connector = MemoryConnector::new(transport);
        let sink = BufferSink::default();
        let mut session = terminal(&sink).with_size_observer(watch::channel(TerminalSize::default()).1);
        session.open(&connector).await.expect("open");

        session.close().await;
        let once = (session.state(), session.has_sink(), session.observes_size(), session.dims());
        session.close().await;
        let twice = (session.state(), session.has_sink(), session.observes_size(), session.dims());
        assert_eq!(once, twice);
        assert_eq!(once, (SessionState::Closed, false, false, None));
        assert_eq!(sink.contents(), "");
    }

    struct SlowClosingTransport {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl StreamTransport for SlowClosingTransport {
        async fn send(&mut self, _frame: Frame) -> Result<(), SessionError> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Some(Err(SessionError::Transport("reset".to_string())))
        }

        async fn close(&mut self) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SlowClosingConnector {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Connector for SlowClosingConnector {
        async fn connect(&self) -> Result<Box<dyn StreamTransport>, SessionError> {
            Ok(Box::new(SlowClosingTransport {
                closes: self.closes.clone(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn input_during_failure_teardown_still_ends_errored() {
        let closes = Arc::new(AtomicUsize::new(0));
        let connector: Arc<dyn Connector> = Arc::new(SlowClosingConnector {
            closes: closes.clone(),
        });
        let sink = BufferSink::default();
        let session = StreamSession::new(SessionKind::Logs, "9", Handshake::None, Box::new(sink.clone()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handle = SessionHandle::spawn(session, connector, move |state| {
            let _ = done_tx.send(state);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.send_input(b"x".to_vec());

        let state = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("session finished in time")
            .expect("finished");
        assert_eq!(state, SessionState::Errored);
        assert_eq!(sink.contents(), "\n[ERROR] reset\n");
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawned_session_forwards_resize_and_closes_on_drop() {
        let (transport, mut remote) = memory_pair();
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new(transport));
        let sink = BufferSink::default();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handle = SessionHandle::spawn(terminal(&sink), connector, move |state| {
            let _ = done_tx.send(state);
        });

        let _handshake = remote.next_sent().await;
        handle.resize(TerminalSize { cols: 132, rows: 43 });
        assert_eq!(
            frame_json(remote.next_sent().await),
            json!({"type": "resize", "cols": 132, "rows": 43})
        );
        assert!(handle.send_input(b"exit\r".to_vec()));
        assert_eq!(remote.next_sent().await, Some(Frame::Text("exit\r".to_string())));

        remote.push_text("bye");
        drop(handle);
        assert_eq!(done_rx.await.expect("finished"), SessionState::Closed);
    }
}
