//! In-process transport pair, used to drive sessions without a network.

use super::transport::{Connector, Frame, SessionError, StreamTransport};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

type Delivery = Result<Frame, SessionError>;

pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

/// The far side of a [`MemoryTransport`].
pub struct RemoteEnd {
    sent: mpsc::UnboundedReceiver<Frame>,
    replies: mpsc::UnboundedSender<Delivery>,
}

pub fn memory_pair() -> (MemoryTransport, RemoteEnd) {
    let (outbound, sent) = mpsc::unbounded_channel();
    let (replies, inbound) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            outbound,
            inbound,
            closed: false,
        },
        RemoteEnd { sent, replies },
    )
}

impl RemoteEnd {
    /// Next frame the session sent; `None` once the session side is gone.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.sent.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<Frame> {
        self.sent.try_recv().ok()
    }

    pub fn push(&self, frame: Frame) -> bool {
        self.replies.send(Ok(frame)).is_ok()
    }

    pub fn push_text(&self, text: &str) -> bool {
        self.push(Frame::Text(text.to_string()))
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.replies
            .send(Err(SessionError::Transport(reason.to_string())))
            .is_ok()
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Send("transport closed".to_string()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::Send("remote end dropped".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.closed = true;
        self.inbound.close();
    }
}

/// Hands out one prepared transport, or refuses every connect.
pub struct MemoryConnector {
    transport: Mutex<Option<MemoryTransport>>,
    refusal: Option<String>,
}

impl MemoryConnector {
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            refusal: None,
        }
    }

    pub fn refusing(reason: &str) -> Self {
        Self {
            transport: Mutex::new(None),
            refusal: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, SessionError> {
        if let Some(reason) = &self.refusal {
            return Err(SessionError::Connect(reason.clone()));
        }
        let taken = self.transport.lock().ok().and_then(|mut slot| slot.take());
        match taken {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(SessionError::Connect("transport already used".to_string())),
        }
    }
}
