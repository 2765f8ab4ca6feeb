//! WebSocket session client.
//!
//! Thin counterpart of the server gateway: connects with a session token,
//! decodes inbound envelopes into an event channel, and offers one send
//! method per client-originated message type. Used by the integration
//! tests and by anything that wants to script a session.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    AnswerChangeData, CompileRequestData, EditData, Envelope, InputChangeData, KickUserData,
    Payload, ProtocolError,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection closed")]
    Closed,
}

/// A connected session.
pub struct SessionClient {
    token: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: Option<mpsc::Receiver<Envelope>>,
}

impl SessionClient {
    /// Connect to `server_url` (e.g. `ws://127.0.0.1:8080/ws`), presenting
    /// `token` as the `session` query parameter.
    pub async fn connect(server_url: &str, token: &str) -> Result<Self, ClientError> {
        let mut url = url::Url::parse(server_url)?;
        url.query_pairs_mut().append_pair("session", token);

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel::<Envelope>(1024);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match Envelope::decode(text.as_str()) {
                        Ok(envelope) => {
                            if event_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        Ok(Self {
            token: token.to_string(),
            state,
            outgoing_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<Envelope>> {
        self.event_rx.take()
    }

    /// Next inbound envelope, `None` once the connection is gone or the
    /// receiver was taken.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        self.event_rx.as_mut()?.recv().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Token this client connected with.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn send_edit(&self, code: impl Into<String>) -> Result<(), ClientError> {
        self.send_payload(Payload::Edit(EditData {
            code: code.into(),
            version: None,
        }))
        .await
    }

    pub async fn send_input(&self, input: impl Into<String>) -> Result<(), ClientError> {
        self.send_payload(Payload::InputChange(InputChangeData {
            input: input.into(),
        }))
        .await
    }

    pub async fn send_answer(&self, answer: impl Into<String>) -> Result<(), ClientError> {
        self.send_payload(Payload::AnswerChange(AnswerChangeData {
            answer: answer.into(),
        }))
        .await
    }

    /// Request a compile. `None` input means "use the shared input".
    pub async fn send_compile(
        &self,
        code: impl Into<String>,
        input: Option<String>,
    ) -> Result<(), ClientError> {
        self.send_payload(Payload::Compile(CompileRequestData {
            code: code.into(),
            input,
        }))
        .await
    }

    pub async fn kick(&self, username: impl Into<String>) -> Result<(), ClientError> {
        self.send_payload(Payload::KickUser(KickUserData {
            username: username.into(),
        }))
        .await
    }

    /// Send a type the server only relays (cursor, chat, ...).
    pub async fn send_relay(&self, kind: impl Into<String>, data: Value) -> Result<(), ClientError> {
        self.send_payload(Payload::Relay {
            kind: kind.into(),
            data,
        })
        .await
    }

    /// Send raw text, bypassing envelope encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(Message::Text(text.into().into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Send a close frame.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn send_payload(&self, payload: Payload) -> Result<(), ClientError> {
        // Sender fields are overwritten server-side.
        let envelope = Envelope {
            username: String::new(),
            display_name: None,
            timestamp: crate::protocol::now_timestamp(),
            payload,
        };
        self.send_raw(envelope.encode()?).await
    }
}
