use crate::session::{
    Connector, Handshake, OutputSink, SessionHandle, SessionKind, SessionState, StreamSession,
};
use deck_core::wire::TerminalSize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// What the tools pane hears from its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output {
        session: u64,
        kind: SessionKind,
        bytes: Vec<u8>,
    },
    Finished {
        session: u64,
        kind: SessionKind,
        state: SessionState,
    },
}

impl SessionEvent {
    pub fn session(&self) -> u64 {
        match self {
            SessionEvent::Output { session, .. } | SessionEvent::Finished { session, .. } => {
                *session
            }
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            SessionEvent::Output { kind, .. } | SessionEvent::Finished { kind, .. } => *kind,
        }
    }
}

struct ChannelSink {
    session: u64,
    kind: SessionKind,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl OutputSink for ChannelSink {
    fn write(&mut self, bytes: &[u8]) {
        let _ = self.tx.send(SessionEvent::Output {
            session: self.session,
            kind: self.kind,
            bytes: bytes.to_vec(),
        });
    }
}

struct ActiveSession {
    id: u64,
    handle: SessionHandle,
}

/// Sessions owned by one tools pane: at most one per kind.
pub struct ToolsPane {
    events: mpsc::UnboundedSender<SessionEvent>,
    active: HashMap<SessionKind, ActiveSession>,
    next_id: u64,
}

impl ToolsPane {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            events,
            active: HashMap::new(),
            next_id: 1,
        }
    }

    /// Opens a session, closing the previous one of the same kind first.
    /// Returns the id tagging the new session's events.
    pub fn open(
        &mut self,
        kind: SessionKind,
        target: &str,
        handshake: Handshake,
        connector: Arc<dyn Connector>,
    ) -> u64 {
        self.close(kind);
        let id = self.next_id;
        self.next_id += 1;

        let sink = ChannelSink {
            session: id,
            kind,
            tx: self.events.clone(),
        };
        let session = StreamSession::new(kind, target, handshake, Box::new(sink));
        let events = self.events.clone();
        let handle = SessionHandle::spawn(session, connector, move |state| {
            let _ = events.send(SessionEvent::Finished {
                session: id,
                kind,
                state,
            });
        });
        debug!(event = "tools_session_opened", kind = %kind, instance = target, session = id);
        self.active.insert(kind, ActiveSession { id, handle });
        id
    }

    pub fn close(&mut self, kind: SessionKind) {
        if let Some(active) = self.active.remove(&kind) {
            active.handle.close();
            debug!(event = "tools_session_closed", kind = %kind, session = active.id);
        }
    }

    /// Pane teardown.
    pub fn close_all(&mut self) {
        let kinds: Vec<SessionKind> = self.active.keys().copied().collect();
        for kind in kinds {
            self.close(kind);
        }
    }

    pub fn target(&self, kind: SessionKind) -> Option<&str> {
        self.active.get(&kind).map(|active| active.handle.target())
    }

    pub fn session_id(&self, kind: SessionKind) -> Option<u64> {
        self.active.get(&kind).map(|active| active.id)
    }

    /// True for events of the session currently holding their kind's slot.
    pub fn is_current(&self, event: &SessionEvent) -> bool {
        self.session_id(event.kind()) == Some(event.session())
    }

    /// Frees the slot once its session reports it has finished.
    pub fn on_event(&mut self, event: &SessionEvent) {
        if let SessionEvent::Finished { session, kind, .. } = event {
            if self.session_id(*kind) == Some(*session) {
                self.active.remove(kind);
            }
        }
    }

    pub fn send_input(&self, kind: SessionKind, bytes: Vec<u8>) -> bool {
        self.active
            .get(&kind)
            .is_some_and(|active| active.handle.send_input(bytes))
    }

    pub fn resize(&self, size: TerminalSize) {
        if let Some(active) = self.active.get(&SessionKind::Terminal) {
            active.handle.resize(size);
        }
    }
}

impl Drop for ToolsPane {
    fn drop(&mut self) {
        self.close_all();
    }
}
