//! WebSocket server and per-connection session gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐  upgrade + token            ┌──► SharedState (code, aux, history)
//!            ├──► Gateway ── dispatch ─────┤
//! Client B ──┘   (reader task per conn)    ├──► Compiler (spawned per request)
//!                       │                  │
//!                       ▼                  ▼
//!                  writer task ◄──queue── Hub loop (register/unregister/broadcast)
//! ```
//!
//! Each connection runs two tasks: the reader dispatches inbound frames,
//! the writer drains the connection's outbound queue and sends keep-alive
//! pings every `ping_interval`. They share nothing but the queue and the socket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthError, Authenticator, Identity, StaticTokens};
use crate::compiler::{CompileResult, Compiler};
use crate::config::{CollabConfig, ConfigError, WebSocketConfig};
use crate::hub::{ConnectionHandle, Hub, HubStats, OutboundQueue};
use crate::protocol::{CompileRequestData, CompileResultData, Envelope, Payload};
use crate::state::{CompileRecord, DocumentState, SharedAuxState, SharedState};

/// Query parameter carrying the session token.
pub const SESSION_QUERY_PARAM: &str = "session";
/// Header alternative to [`SESSION_QUERY_PARAM`].
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("write timed out")]
    WriteTimeout,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub hub: HubStats,
    pub frames_received: u64,
    pub protocol_errors: u64,
    pub auth_rejected: u64,
    pub compiles: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    frames_received: AtomicU64,
    protocol_errors: AtomicU64,
    auth_rejected: AtomicU64,
    compiles: AtomicU64,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Everything a session needs; cloned into each connection task.
#[derive(Clone)]
struct Gateway {
    state: Arc<SharedState>,
    hub: Hub,
    compiler: Arc<Compiler>,
    auth: Arc<dyn Authenticator>,
    websocket: WebSocketConfig,
    ws_path: String,
    stats: Arc<AtomicServerStats>,
}

/// The collaboration server.
pub struct CollabServer {
    config: CollabConfig,
    gateway: Gateway,
}

impl CollabServer {
    /// Create a server authenticating against the config's token table.
    ///
    /// Must be called from within a tokio runtime: the hub loop is
    /// spawned immediately.
    pub fn new(config: CollabConfig) -> Self {
        let auth = Arc::new(StaticTokens::from_config(&config.auth));
        Self::with_authenticator(config, auth)
    }

    /// Create a server with an external credential collaborator.
    pub fn with_authenticator(config: CollabConfig, auth: Arc<dyn Authenticator>) -> Self {
        let state = Arc::new(SharedState::new(&config.document));
        let hub = Hub::start(state.clone());
        let gateway = Gateway {
            state,
            hub,
            compiler: Arc::new(Compiler::new(config.compiler.clone())),
            auth,
            websocket: config.websocket.clone(),
            ws_path: config.server.ws_path.clone(),
            stats: Arc::new(AtomicServerStats::default()),
        };
        Self { config, gateway }
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.server.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// close every connection.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        log::info!(
            "Collaboration server listening on ws://{}{}",
            listener.local_addr()?,
            self.gateway.ws_path
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let gateway = self.gateway.clone();
                        tokio::spawn(async move { gateway.handle_connection(stream, addr).await });
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                _ = &mut shutdown => {
                    log::info!("Shutting down; closing all connections");
                    break;
                }
            }
        }

        self.gateway.hub.shutdown();
        Ok(())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.server.bind_addr
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.gateway.state
    }

    pub fn hub(&self) -> &Hub {
        &self.gateway.hub
    }

    pub async fn document_snapshot(&self) -> DocumentState {
        self.gateway.state.document().await
    }

    pub async fn aux_snapshot(&self) -> SharedAuxState {
        self.gateway.state.aux().await
    }

    pub async fn compile_history(&self) -> Vec<CompileRecord> {
        self.gateway.state.compile_history().await
    }

    pub async fn list_online(&self) -> Vec<Identity> {
        self.gateway.hub.list_online().await
    }

    /// Current code as `(filename, body)` for download.
    pub async fn export_code(&self) -> (String, String) {
        self.gateway.state.export_code().await
    }

    /// Run the pipeline directly, without touching shared state or
    /// broadcasting.
    pub async fn submit_compile(&self, code: &str, stdin: &str) -> CompileResult {
        self.gateway.compiler.compile_and_run(code, stdin).await
    }

    pub fn stats(&self) -> ServerStats {
        let stats = &self.gateway.stats;
        ServerStats {
            hub: self.gateway.hub.stats(),
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            protocol_errors: stats.protocol_errors.load(Ordering::Relaxed),
            auth_rejected: stats.auth_rejected.load(Ordering::Relaxed),
            compiles: stats.compiles.load(Ordering::Relaxed),
        }
    }
}

impl Gateway {
    /// Upgrade, authenticate, register, then run the session until either
    /// side gives up.
    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) {
        let mut identity: Option<Identity> = None;
        let mut rejection: Option<AuthError> = None;

        let callback = |request: &Request, response: Response| {
            if request.uri().path() != self.ws_path {
                return Err(reject(StatusCode::NOT_FOUND, "not found"));
            }
            match self.auth.authenticate(&session_token(request)) {
                Ok(id) => {
                    identity = Some(id);
                    Ok(response)
                }
                Err(e) => {
                    self.stats.auth_rejected.fetch_add(1, Ordering::Relaxed);
                    let reason = e.to_string();
                    rejection = Some(e);
                    Err(reject(StatusCode::UNAUTHORIZED, &reason))
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                if let Some(reason) = rejection {
                    log::warn!("Refused connection from {addr}: {reason}");
                } else {
                    log::debug!("Handshake with {addr} failed: {e}");
                }
                return;
            }
        };
        let Some(identity) = identity else {
            return;
        };

        log::info!(
            "WebSocket session for {} ({}) from {addr}",
            identity.username,
            identity.display_name
        );

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (connection, queue) =
            ConnectionHandle::new(identity.clone(), self.websocket.outbound_capacity);
        let connection_id = connection.id();
        let kill = queue.kill_signal();
        self.hub.register(connection);

        let mut writer = tokio::spawn(write_loop(
            ws_sender,
            queue,
            self.websocket.clone(),
            identity.username.clone(),
        ));

        let writer_done = self.read_loop(ws_receiver, &identity, kill, &mut writer).await;

        self.hub.unregister(connection_id);
        if !writer_done {
            let _ = writer.await;
        }
        log::debug!("Session for {} from {addr} ended", identity.username);
    }

    /// Returns `true` if the loop ended because the writer finished.
    async fn read_loop(
        &self,
        mut ws_receiver: WsSource,
        identity: &Identity,
        mut kill: tokio::sync::watch::Receiver<bool>,
        writer: &mut JoinHandle<()>,
    ) -> bool {
        let deadline = self.websocket.read_timeout();

        loop {
            tokio::select! {
                next = tokio::time::timeout(deadline, ws_receiver.next()) => match next {
                    Err(_) => {
                        log::info!("{} missed the liveness deadline", identity.username);
                        return false;
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                        log::info!("Connection closed by {}", identity.username);
                        return false;
                    }
                    Ok(Some(Err(e))) => {
                        log::warn!("WebSocket error from {}: {e}", identity.username);
                        return false;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        self.handle_text(identity, text.as_str()).await;
                    }
                    Ok(Some(Ok(Message::Binary(data)))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_text(identity, text).await,
                        Err(_) => {
                            self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Non-UTF-8 binary frame from {}", identity.username);
                        }
                    },
                    // Ping/pong only extend the deadline.
                    Ok(Some(Ok(_))) => {}
                },
                _ = kill.changed() => {
                    log::debug!("{} removed by the hub; stopping reader", identity.username);
                    return false;
                }
                _ = &mut *writer => return true,
            }
        }
    }

    async fn handle_text(&self, identity: &Identity, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        match Envelope::decode(text) {
            Ok(envelope) => self.dispatch(identity, envelope.stamp(identity)).await,
            Err(e) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping frame from {}: {e}", identity.username);
            }
        }
    }

    /// Apply an inbound envelope and re-broadcast it where appropriate.
    async fn dispatch(&self, identity: &Identity, mut envelope: Envelope) {
        if let Payload::Edit(edit) = &envelope.payload {
            let code = edit.code.clone();
            self.publish_edit(identity, code, envelope).await;
            return;
        }

        match &mut envelope.payload {
            Payload::InputChange(change) => self.state.set_input(change.input.as_str()).await,
            Payload::AnswerChange(change) => self.state.set_answer(change.answer.as_str()).await,
            Payload::Compile(request) => {
                self.spawn_compile(identity.clone(), request.clone());
                return;
            }
            Payload::KickUser(kick) => {
                let target = kick.username.clone();
                self.kick_user(identity, &target).await;
                return;
            }
            _ => {}
        }

        if let Err(e) = self.hub.broadcast(&envelope) {
            log::error!("Failed to broadcast {}: {e}", envelope.kind());
        }
    }

    /// Apply an edit and hand its echo to the hub under the document lock,
    /// so echoes reach the hub in version order.
    async fn publish_edit(&self, identity: &Identity, code: String, mut envelope: Envelope) {
        let hub = &self.hub;
        let doc = self
            .state
            .apply_edit_with(code, |doc| {
                if let Payload::Edit(edit) = &mut envelope.payload {
                    edit.version = Some(doc.version);
                }
                if let Err(e) = hub.broadcast(&envelope) {
                    log::error!("Failed to broadcast edit: {e}");
                }
            })
            .await;
        log::trace!("{} edit -> v{}", identity.username, doc.version);
    }

    async fn kick_user(&self, identity: &Identity, target: &str) {
        if !self.auth.is_administrator(identity) {
            log::warn!(
                "{} tried to kick {target} without administrator rights",
                identity.username
            );
            return;
        }

        let removed = self.hub.kick(target).await;
        log::info!(
            "{} kicked {target} ({removed} connection(s))",
            identity.username
        );
        if let Err(e) = self
            .hub
            .broadcast(&Envelope::user_kicked(target, &identity.username))
        {
            log::error!("Failed to broadcast user_kicked: {e}");
        }
    }

    /// Compile off the reader task. The result reaches the requester only
    /// through the broadcast, so it stays valid if they disconnect.
    fn spawn_compile(&self, identity: Identity, request: CompileRequestData) {
        self.stats.compiles.fetch_add(1, Ordering::Relaxed);
        let state = self.state.clone();
        let hub = self.hub.clone();
        let compiler = self.compiler.clone();
        tokio::spawn(async move {
            run_compile(&state, &hub, &compiler, &identity, request).await;
        });
    }
}

async fn run_compile(
    state: &SharedState,
    hub: &Hub,
    compiler: &Compiler,
    identity: &Identity,
    request: CompileRequestData,
) {
    let stdin = match request.input.filter(|input| !input.is_empty()) {
        Some(input) => input,
        None => state.aux().await.input_data,
    };

    log::info!("{} started a compile", identity.username);
    let started = Instant::now();
    let result = compiler.compile_and_run(&request.code, &stdin).await;
    log::info!(
        "Compile for {} finished in {:?} (success: {})",
        identity.username,
        started.elapsed(),
        result.success
    );

    state.record_compile(identity.username.as_str(), result.success).await;
    state.set_output(result.output.as_str()).await;
    let entry = format!(
        "\n[{}] {} compiled\n{}\n",
        chrono::Local::now().format("%H:%M:%S"),
        identity.username,
        result.message
    );
    let compile_log = state.append_log(&entry).await;

    let envelope = Envelope::from_identity(
        identity,
        Payload::CompileResult(CompileResultData {
            success: result.success,
            message: result.message,
            output: result.output,
            compiled_by: identity.username.clone(),
            compile_log,
        }),
    );
    if let Err(e) = hub.broadcast(&envelope) {
        log::error!("Failed to broadcast compile_result: {e}");
    }
}

/// Drain the outbound queue to the socket, pinging on a fixed period.
///
/// The ping ticks regardless of traffic: a client that only listens
/// answers nothing but pongs, and those are what keep its reader alive.
async fn write_loop(
    mut sink: WsSink,
    mut queue: OutboundQueue,
    websocket: WebSocketConfig,
    username: String,
) {
    let period = websocket.ping_interval();
    let limit = websocket.write_timeout();
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    let mut kill = queue.kill_signal();
    let mut watching_kill = true;

    loop {
        let outcome = tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    send_with_timeout(&mut sink, Message::Text(frame.to_string().into()), limit).await
                }
                None => {
                    let _ = send_with_timeout(&mut sink, Message::Close(None), limit).await;
                    break;
                }
            },
            _ = ping.tick() => send_with_timeout(&mut sink, Message::Ping(Vec::new().into()), limit).await,
            changed = kill.changed(), if watching_kill => match changed {
                Ok(()) if *kill.borrow() => {
                    log::debug!("Closing socket of {username} on request");
                    let _ = send_with_timeout(&mut sink, Message::Close(None), limit).await;
                    break;
                }
                Ok(()) => Ok(()),
                Err(_) => {
                    watching_kill = false;
                    Ok(())
                }
            },
        };

        if let Err(e) = outcome {
            log::debug!("Write to {username} failed: {e}");
            break;
        }
    }

    let _ = tokio::time::timeout(limit, sink.close()).await;
}

async fn send_with_timeout(
    sink: &mut WsSink,
    message: Message,
    limit: std::time::Duration,
) -> Result<(), ServerError> {
    match tokio::time::timeout(limit, sink.send(message)).await {
        Ok(result) => result.map_err(ServerError::from),
        Err(_) => Err(ServerError::WriteTimeout),
    }
}

/// Session token from the `session` query parameter or the
/// `X-Session-ID` header. Empty if neither is present.
fn session_token(request: &Request) -> String {
    let from_query = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == SESSION_QUERY_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    from_query
        .or_else(|| {
            request
                .headers()
                .get(SESSION_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
