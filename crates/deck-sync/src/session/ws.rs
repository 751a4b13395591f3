use super::transport::{Connector, Frame, SessionError, StreamTransport};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Close(reason) => Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.unwrap_or_default().into(),
            })),
            Frame::End(reason) => Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            })),
        };
        self.ws
            .send(message)
            .await
            .map_err(|err| SessionError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
        loop {
            let message = match self.ws.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(SessionError::Transport(err.to_string()))),
            };
            return Some(Ok(match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(bytes) => Frame::Binary(bytes),
                Message::Close(close) => Frame::Close(
                    close
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty()),
                ),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }));
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.ws.close(None).await {
            debug!(event = "ws_close_error", error = %err);
        }
    }
}

pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, SessionError> {
        let (ws, _) = connect_async(self.url.clone())
            .await
            .map_err(|err| SessionError::Connect(format!("{}: {err}", self.url)))?;
        Ok(Box::new(WsTransport { ws }))
    }
}
