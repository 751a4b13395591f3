//! Log tailing over repeated offset polls, exposed as a stream transport.

use super::transport::{Connector, Frame, SessionError, StreamTransport};
use crate::client::{ApiError, RemoteApi};
use async_trait::async_trait;
use deck_core::wire::LogChunk;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_millis(2000);

const LOGS_ENDED_REASON: &str = "logs unavailable";

/// Anything that can serve log chunks after an offset.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch_logs(&self, id: &str, offset: u64) -> Result<LogChunk, ApiError>;
}

#[async_trait]
impl<T: RemoteApi + ?Sized> LogSource for T {
    async fn fetch_logs(&self, id: &str, offset: u64) -> Result<LogChunk, ApiError> {
        RemoteApi::fetch_logs(self, id, offset).await
    }
}

/// Last acknowledged log size. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    offset: u64,
}

impl LogCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Content to surface for a chunk. Empty chunks and chunks that do not
    /// move past the current offset are ignored.
    pub fn accept(&mut self, chunk: LogChunk) -> Option<String> {
        if chunk.content.is_empty() {
            return None;
        }
        if chunk.size <= self.offset {
            debug!(
                event = "log_chunk_stale",
                offset = self.offset,
                size = chunk.size
            );
            return None;
        }
        self.offset = chunk.size;
        Some(chunk.content)
    }
}

pub struct LogTailTransport<S: ?Sized> {
    source: Arc<S>,
    id: String,
    cursor: LogCursor,
    interval: Duration,
    primed: bool,
    closed: bool,
}

impl<S: LogSource + ?Sized> LogTailTransport<S> {
    pub fn new(source: Arc<S>, id: impl Into<String>, interval: Duration) -> Self {
        Self {
            source,
            id: id.into(),
            cursor: LogCursor::default(),
            interval,
            primed: false,
            closed: false,
        }
    }

    pub fn cursor(&self) -> LogCursor {
        self.cursor
    }
}

#[async_trait]
impl<S: LogSource + ?Sized + 'static> StreamTransport for LogTailTransport<S> {
    /// The log stream is read-only; outbound frames are ignored.
    async fn send(&mut self, _frame: Frame) -> Result<(), SessionError> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
        loop {
            if self.closed {
                return None;
            }
            if self.primed {
                tokio::time::sleep(self.interval).await;
            }
            self.primed = true;

            match self.source.fetch_logs(&self.id, self.cursor.offset()).await {
                Ok(chunk) => {
                    if let Some(content) = self.cursor.accept(chunk) {
                        return Some(Ok(Frame::Text(content)));
                    }
                }
                Err(ApiError::LogsUnavailable { .. }) => {
                    self.closed = true;
                    return Some(Ok(Frame::End(LOGS_ENDED_REASON.to_string())));
                }
                Err(err) => {
                    self.closed = true;
                    return Some(Err(SessionError::Transport(err.reason())));
                }
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

pub struct LogTailConnector<S: ?Sized> {
    source: Arc<S>,
    id: String,
    interval: Duration,
}

impl<S: LogSource + ?Sized> LogTailConnector<S> {
    pub fn new(source: Arc<S>, id: impl Into<String>, interval: Duration) -> Self {
        Self {
            source,
            id: id.into(),
            interval,
        }
    }
}

#[async_trait]
impl<S: LogSource + ?Sized + 'static> Connector for LogTailConnector<S> {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, SessionError> {
        Ok(Box::new(LogTailTransport::new(
            self.source.clone(),
            self.id.clone(),
            self.interval,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLogs {
        replies: Mutex<VecDeque<Result<LogChunk, ApiError>>>,
        offsets: Mutex<Vec<u64>>,
    }

    impl ScriptedLogs {
        fn new(replies: Vec<Result<LogChunk, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                offsets: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LogSource for ScriptedLogs {
        async fn fetch_logs(&self, id: &str, offset: u64) -> Result<LogChunk, ApiError> {
            self.offsets.lock().expect("offsets").push(offset);
            self.replies
                .lock()
                .expect("replies")
                .pop_front()
                .unwrap_or(Err(ApiError::LogsUnavailable { id: id.to_string() }))
        }
    }

    fn chunk(content: &str, size: u64) -> Result<LogChunk, ApiError> {
        Ok(LogChunk {
            content: content.to_string(),
            size,
        })
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut cursor = LogCursor::default();
        assert_eq!(cursor.accept(LogChunk { content: "ab".into(), size: 2 }), Some("ab".into()));
        assert_eq!(cursor.accept(LogChunk { content: String::new(), size: 9 }), None);
        assert_eq!(cursor.accept(LogChunk { content: "zz".into(), size: 1 }), None);
        assert_eq!(cursor.offset(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tail_resumes_from_acknowledged_offset() {
        let source = ScriptedLogs::new(vec![
            chunk("ab", 2),
            chunk("", 2),
            chunk("cd", 4),
        ]);
        let mut transport =
            LogTailTransport::new(source.clone(), "7", Duration::from_millis(2000));

        let started = tokio::time::Instant::now();
        let mut rendered = String::new();
        for _ in 0..2 {
            match transport.recv().await {
                Some(Ok(Frame::Text(text))) => rendered.push_str(&text),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(rendered, "abcd");
        assert_eq!(transport.cursor().offset(), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(4000));
        assert_eq!(*source.offsets.lock().expect("offsets"), vec![0, 2, 2]);

        assert_eq!(
            transport.recv().await,
            Some(Ok(Frame::End("logs unavailable".to_string())))
        );
        assert_eq!(transport.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_is_a_transport_error() {
        let source = ScriptedLogs::new(vec![Err(ApiError::Decode("bad json".into()))]);
        let mut transport = LogTailTransport::new(source, "7", DEFAULT_LOG_INTERVAL);
        assert!(matches!(
            transport.recv().await,
            Some(Err(SessionError::Transport(_)))
        ));
        transport.close().await;
        assert_eq!(transport.recv().await, None);
    }
}
