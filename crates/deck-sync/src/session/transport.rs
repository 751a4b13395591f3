use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("{0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Unit exchanged over a session transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Graceful close by the remote side, with its reason if it gave one.
    Close(Option<String>),
    /// The stream has nothing more to give, e.g. a log tail whose instance stopped.
    End(String),
}

#[async_trait]
pub trait StreamTransport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError>;
    /// Next frame from the remote side; `None` once the transport is gone.
    async fn recv(&mut self) -> Option<Result<Frame, SessionError>>;
    async fn close(&mut self);
}

/// Opens a fresh transport for one session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, SessionError>;
}
