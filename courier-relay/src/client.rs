//! WebSocket client for the relay gateway.
//!
//! Provides:
//! - Request/reply correlation by request id
//! - Typed helpers for every command
//! - An event channel for broadcast notifications
//! - Presence join and typing notices

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::error::ErrorBody;
use crate::model::{
    CallSession, CallStatus, Conversation, DeliveryJob, Message, NewCall, NewConversation,
    SequencedSignal, SignalKind,
};
use crate::presence::TypingNotice;
use crate::protocol::{ClientFrame, Command, ProtocolError, RelayEvent, Reply, ServerFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Protocol(ProtocolError),
    /// The relay rejected the request.
    Remote(ErrorBody),
    /// The reply did not match the command sent.
    UnexpectedReply,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Protocol(e) => write!(f, "{e}"),
            ClientError::Remote(body) => write!(f, "Relay error ({:?}): {}", body.kind, body.message),
            ClientError::UnexpectedReply => write!(f, "Unexpected reply"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, ErrorBody>>>>>;

pub struct RelayClient {
    /// Frames for the writer task
    outgoing_tx: mpsc::Sender<ClientFrame>,
    pending: PendingReplies,
    next_request: AtomicU64,
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
    state: Arc<RwLock<ConnectionState>>,
    request_timeout: Duration,
}

impl RelayClient {
    /// Connect to a relay server at `url` (e.g. `ws://127.0.0.1:9190`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientFrame>(256);
        let (event_tx, event_rx) = mpsc::channel::<RelayEvent>(256);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Writer task: forward outgoing frames to the socket
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(WsMessage::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route replies and events
        let reader_pending = pending.clone();
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => match ServerFrame::decode(&data) {
                        Ok(ServerFrame::Reply { request_id, result }) => {
                            if let Some(tx) = reader_pending.lock().await.remove(&request_id) {
                                let _ = tx.send(result);
                            }
                        }
                        Ok(ServerFrame::Event(event)) => {
                            // Events are best-effort; replies must keep flowing
                            match event_tx.try_send(event) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(event)) => {
                                    log::warn!("Event channel full, dropping {}", event.name());
                                }
                                Err(mpsc::error::TrySendError::Closed(event)) => {
                                    log::trace!("No event listener, dropping {}", event.name());
                                }
                            }
                        }
                        Ok(ServerFrame::Pong) => log::trace!("Pong"),
                        Err(e) => log::warn!("Failed to decode server frame: {e}"),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            // Dropping the senders fails every outstanding request
            reader_pending.lock().await.clear();
            log::debug!("Relay connection closed");
        });

        Ok(Self {
            outgoing_tx,
            pending,
            next_request: AtomicU64::new(1),
            event_rx: Some(event_rx),
            state,
            request_timeout: Duration::from_secs(35),
        })
    }

    /// Override how long `request` waits for a reply (default 35s, just
    /// above the relay's default submit timeout).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Send a command and wait for its reply.
    pub async fn request(&self, command: Command) -> Result<Reply, ClientError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self
            .outgoing_tx
            .send(ClientFrame::Request { request_id, command })
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(body))) => Err(ClientError::Remote(body)),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed.into())
    }

    pub async fn join_presence(&self, user_id: &str, display_name: &str) -> Result<(), ClientError> {
        self.send(ClientFrame::PresenceJoin {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        })
        .await
    }

    pub async fn send_typing(&self, notice: TypingNotice) -> Result<(), ClientError> {
        self.send(ClientFrame::Typing(notice)).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientFrame::Ping).await
    }

    // ─── Typed commands ───────────────────────────────────────────────

    pub async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, ClientError> {
        match self.request(Command::CreateConversation(new)).await? {
            Reply::Conversation(conversation) => Ok(conversation),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, ClientError> {
        let command = Command::ListConversations {
            user_id: user_id.to_string(),
        };
        match self.request(command).await? {
            Reply::Conversations(conversations) => Ok(conversations),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn submit_message(&self, job: DeliveryJob) -> Result<Message, ClientError> {
        match self.request(Command::SubmitMessage(job)).await? {
            Reply::Message(message) => Ok(message),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn update_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        body: &str,
    ) -> Result<Message, ClientError> {
        let command = Command::UpdateMessage {
            conversation_id,
            message_id,
            body: body.to_string(),
        };
        match self.request(command).await? {
            Reply::Message(message) => Ok(message),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn delete_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<Message, ClientError> {
        let command = Command::DeleteMessage {
            conversation_id,
            message_id,
        };
        match self.request(command).await? {
            Reply::Message(message) => Ok(message),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
        match self.request(Command::ListMessages { conversation_id }).await? {
            Reply::Messages(messages) => Ok(messages),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn start_call(&self, new: NewCall) -> Result<CallSession, ClientError> {
        match self.request(Command::StartCall(new)).await? {
            Reply::Call(call) => Ok(call),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn update_call_status(&self, call_id: Uuid, status: CallStatus) -> Result<CallSession, ClientError> {
        match self.request(Command::UpdateCallStatus { call_id, status }).await? {
            Reply::Call(call) => Ok(call),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn list_calls(&self, conversation_id: Uuid) -> Result<Vec<CallSession>, ClientError> {
        match self.request(Command::ListCalls { conversation_id }).await? {
            Reply::Calls(calls) => Ok(calls),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Post a signal; returns its sequence in the (call, kind) bucket.
    pub async fn post_signal(
        &self,
        call_id: Uuid,
        kind: SignalKind,
        sender_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, ClientError> {
        let command = Command::PostSignal {
            call_id,
            kind,
            sender_id: sender_id.to_string(),
            payload,
        };
        match self.request(command).await? {
            Reply::SignalPosted { sequence } => Ok(sequence),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    pub async fn list_signals(
        &self,
        call_id: Uuid,
        kind: SignalKind,
        since: Option<u64>,
    ) -> Result<Vec<SequencedSignal>, ClientError> {
        match self.request(Command::ListSignals { call_id, kind, since }).await? {
            Reply::Signals(signals) => Ok(signals),
            _ => Err(ClientError::UnexpectedReply),
        }
    }
}
