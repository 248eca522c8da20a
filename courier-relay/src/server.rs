//! WebSocket gateway in front of a `Relay`.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── Request ──► spawned task ──► dispatch ──┐
//!            ├── connection ───┤                                           │ Reply
//! Client B ──┘   (observer)    ├── PresenceJoin / Typing ──► Relay         │
//!                              │                                           ▼
//!                              └◄── Event ◄── Broadcaster      outbound mpsc ──► socket
//! ```
//!
//! Each connection is one broadcaster observer. Requests run on their own
//! tasks so a submit waiting on the delivery queue never stalls event
//! delivery or other requests on the same socket.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::RelayError;
use crate::protocol::{ClientFrame, Command, Reply, ServerFrame};
use crate::relay::Relay;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection while the socket is busy
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9190".to_string(),
            outbound_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Defaults with `COURIER_BIND_ADDR` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("COURIER_BIND_ADDR") {
            if !addr.trim().is_empty() {
                config.bind_addr = addr.trim().to_string();
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: Arc<Relay>) -> Self {
        Self {
            config,
            relay,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and accept connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();
            let outbound_capacity = self.config.outbound_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, relay, stats, outbound_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<Relay>,
        stats: Arc<RwLock<ServerStats>>,
        outbound_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut subscription = relay.connect_observer(addr.to_string()).await;
        let observer_id = subscription.observer_id();
        // Replies from spawned request tasks; the sender kept here keeps it open
        let (reply_tx, mut reply_rx) = mpsc::channel::<ServerFrame>(outbound_capacity.max(1));

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(WsMessage::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientFrame::decode(&data) {
                                    Ok(ClientFrame::Request { request_id, command }) => {
                                        let relay = relay.clone();
                                        let reply_tx = reply_tx.clone();
                                        tokio::spawn(async move {
                                            let result = dispatch(&relay, command)
                                                .await
                                                .map_err(|e| e.to_body());
                                            let _ = reply_tx
                                                .send(ServerFrame::Reply { request_id, result })
                                                .await;
                                        });
                                    }
                                    Ok(ClientFrame::PresenceJoin { user_id, display_name }) => {
                                        relay.presence_join(observer_id, &user_id, &display_name).await;
                                    }
                                    Ok(ClientFrame::Typing(notice)) => {
                                        relay.typing(observer_id, notice).await;
                                    }
                                    Ok(ClientFrame::Ping) => {
                                        let encoded = ServerFrame::Pong.encode()?;
                                        ws_sender.send(WsMessage::Binary(encoded.into())).await?;
                                    }
                                    Err(e) => {
                                        stats.write().await.rejected_frames += 1;
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(WsMessage::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(WsMessage::Ping(data))) => {
                                ws_sender.send(WsMessage::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Reply from a finished request
                    Some(frame) = reply_rx.recv() => {
                        let encoded = frame.encode()?;
                        ws_sender.send(WsMessage::Binary(encoded.into())).await?;
                    }

                    // Outgoing broadcast event
                    event = subscription.recv() => {
                        match event {
                            Some(event) => {
                                let encoded = ServerFrame::Event(event).encode()?;
                                ws_sender.send(WsMessage::Binary(encoded.into())).await?;
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup runs even when the socket failed mid-send
        relay.disconnect_observer(observer_id).await;
        stats.write().await.active_connections -= 1;
        log::debug!("Observer {observer_id} from {addr} cleaned up");

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

/// Run one command against the relay.
pub async fn dispatch(relay: &Relay, command: Command) -> Result<Reply, RelayError> {
    match command {
        Command::CreateConversation(new) => relay.create_conversation(new).await.map(Reply::Conversation),
        Command::ListConversations { user_id } => {
            relay.list_conversations(&user_id).await.map(Reply::Conversations)
        }
        Command::SubmitMessage(job) => relay.submit_message(job).await.map(Reply::Message),
        Command::UpdateMessage {
            conversation_id,
            message_id,
            body,
        } => relay
            .update_message(conversation_id, message_id, &body)
            .await
            .map(Reply::Message),
        Command::DeleteMessage {
            conversation_id,
            message_id,
        } => relay
            .delete_message(conversation_id, message_id)
            .await
            .map(Reply::Message),
        Command::ListMessages { conversation_id } => {
            relay.list_messages(conversation_id).await.map(Reply::Messages)
        }
        Command::StartCall(new) => relay.start_call(new).await.map(Reply::Call),
        Command::UpdateCallStatus { call_id, status } => {
            relay.update_call_status(call_id, status).await.map(Reply::Call)
        }
        Command::ListCalls { conversation_id } => {
            Ok(Reply::Calls(relay.list_calls(conversation_id).await))
        }
        Command::PostSignal {
            call_id,
            kind,
            sender_id,
            payload,
        } => relay
            .append_signal(call_id, kind, &sender_id, payload)
            .await
            .map(|sequence| Reply::SignalPosted { sequence }),
        Command::ListSignals {
            call_id,
            kind,
            since,
        } => relay
            .list_signals_since(call_id, kind, since.unwrap_or(0))
            .await
            .map(Reply::Signals),
    }
}
