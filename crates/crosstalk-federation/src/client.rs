// Per-session federation tunnel to a peer signaling server.
//
// A tunnel owns its connection exclusively: the read half lives in the read
// loop, all writes serialize behind one async mutex and a keepalive loop
// pings on a fixed period. The handshake (welcome, authenticated hello,
// room join) runs on the read loop; once the remote identity is published,
// frames in both directions are proxied with session-id translation.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crosstalk_proto::{
    ClientMessage, FederationAuthParams, HelloClientAuth, HelloClientMessage, HelloServerMessage,
    RecipientKind, RoomClientMessage, RoomFederationMessage, ServerMessage, SignalingError,
    ERROR_FEDERATION_ERROR, FEATURE_FEDERATION, HELLO_AUTH_TYPE_FEDERATION, HELLO_VERSION,
};

use crate::transport::{self, WsStream};
use crate::{FederationConfig, FederationError, LocalSession};

/// How long a read may go without any frame (pongs included) before the
/// connection is considered dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// Keepalive ping period; must stay below [`PONG_TIMEOUT`].
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Deadline for writing a single frame.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Hello resends tolerated on correlation mismatch before giving up.
const MAX_HELLO_RETRIES: u32 = 3;

type MessageSink = SplitSink<WsStream, Message>;

/// Handshake phases. Owned by the read loop; nothing else advances them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    WaitWelcome,
    WaitHelloResponse,
    WaitRoomResponse,
    Established,
}

/// Correlation state of the in-flight hello request. The credentials are
/// retained so a mismatched reply can be answered with a fresh hello.
struct HelloExchange {
    msg_id: Option<String>,
    auth: FederationAuthParams,
    retries: u32,
}

/// An outbound signaling session to a peer server, opened on behalf of one
/// local client joining a federated room.
pub struct FederationClient {
    session: Arc<dyn LocalSession>,
    /// Correlation id of the client's original join message; echoed on the
    /// final join ack and on synthetic errors.
    join_id: Option<String>,
    room_id: String,
    room_session_id: String,
    federation: RoomFederationMessage,
    url: String,
    writer: Mutex<Option<MessageSink>>,
    closer: CancellationToken,
    remote_hello: OnceLock<HelloServerMessage>,
}

impl FederationClient {
    /// Open a tunnel on behalf of `session`'s federated room join.
    ///
    /// Dials the peer named by the join's federation descriptor, verifies
    /// it accepts federated sessions and spawns the read and keepalive
    /// loops. The handshake continues asynchronously; failures past this
    /// point reach `session` as in-band `error` messages.
    pub async fn connect(
        session: Arc<dyn LocalSession>,
        join: &ClientMessage,
        config: &FederationConfig,
    ) -> Result<Arc<Self>, FederationError> {
        if join.kind != "room" {
            return Err(FederationError::InvalidJoin(format!(
                "expected a room message, got {:?}",
                join.kind
            )));
        }
        let room = join
            .room
            .as_ref()
            .ok_or_else(|| FederationError::InvalidJoin("missing room payload".into()))?;
        let federation = room
            .federation
            .clone()
            .ok_or_else(|| FederationError::InvalidJoin("missing federation descriptor".into()))?;

        let url = transport::to_ws_url(&federation.signaling_url);
        let stream = transport::connect(&url, config).await?;
        let (sink, stream) = stream.split();

        let client = Arc::new(Self {
            session,
            join_id: join.id.clone(),
            room_id: room.room_id.clone(),
            room_session_id: room.session_id.clone().unwrap_or_default(),
            federation,
            url,
            writer: Mutex::new(Some(sink)),
            closer: CancellationToken::new(),
            remote_hello: OnceLock::new(),
        });

        info!(
            url = %client.url,
            session = %client.session.public_id(),
            "creating federation connection"
        );

        tokio::spawn(Arc::clone(&client).read_loop(stream));
        tokio::spawn(Arc::clone(&client).write_loop());

        Ok(client)
    }

    /// The resolved URL of the peer server.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The identity the peer assigned to this tunnel. `None` until the
    /// handshake is established; set exactly once by the read loop.
    pub fn remote_hello(&self) -> Option<&HelloServerMessage> {
        self.remote_hello.get()
    }

    /// Tear the tunnel down. Safe to call from any task, any number of
    /// times; both loops observe the cancellation and exit, and later
    /// sends fail with [`FederationError::NotConnected`].
    pub async fn close(&self) {
        self.closer.cancel();

        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            info!(
                url = %self.url,
                session = %self.session.public_id(),
                "closing federation connection"
            );
            if let Err(err) = sink.close().await {
                debug!(url = %self.url, error = %err, "error closing federation connection");
            }
        }
    }

    /// Close the tunnel and surface `err` to the primary session as an
    /// in-band error, tagged with the original join's correlation id.
    async fn close_with_error(&self, err: FederationError) {
        self.close().await;
        self.session
            .send_message(ServerMessage::error(self.join_id.clone(), err.to_signaling_error()));
    }

    /// Forward a client frame to the peer, rewriting targeted messages
    /// addressed to the session's own local id into the remote identity.
    pub async fn proxy_message(&self, message: &ClientMessage) -> Result<(), FederationError> {
        let mut message = message.clone();
        if message.kind == "message" {
            if let (Some(payload), Some(hello)) = (message.message.as_mut(), self.remote_hello.get())
            {
                let public_id = self.session.public_id();
                let recipient = &mut payload.recipient;
                if recipient.kind == RecipientKind::Session
                    && recipient.session_id.as_deref() == Some(public_id.as_str())
                {
                    recipient.session_id = Some(hello.session_id.clone());
                }
            }
        }
        self.send_message(&message).await
    }

    /// Send a frame to the peer without identity rewriting. All writes,
    /// handshake and keepalive included, serialize through the writer lock.
    pub async fn send_message(&self, message: &ClientMessage) -> Result<(), FederationError> {
        let frame = serde_json::to_string(message)?;

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(FederationError::NotConnected);
        };

        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::text(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                // A close frame already went out; nothing else can follow.
                Err(FederationError::CloseSent)
            }
            Ok(Err(err)) => {
                warn!(
                    url = %self.url,
                    session = %self.session.public_id(),
                    error = %err,
                    "could not send message to federated server"
                );
                self.send_close_frame(sink).await;
                Err(FederationError::WebSocket(err))
            }
            Err(_) => {
                warn!(
                    url = %self.url,
                    session = %self.session.public_id(),
                    "timed out sending message to federated server"
                );
                self.send_close_frame(sink).await;
                Err(FederationError::Timeout("sending a frame"))
            }
        }
    }

    /// Best-effort close frame after a failed send.
    async fn send_close_frame(&self, sink: &mut MessageSink) {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "".into(),
        }));
        if let Ok(Err(err)) = tokio::time::timeout(WRITE_TIMEOUT, sink.send(close)).await {
            debug!(url = %self.url, error = %err, "could not send close frame to federated server");
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        let mut state = HandshakeState::WaitWelcome;
        let mut hello = HelloExchange {
            msg_id: None,
            auth: FederationAuthParams {
                token: self.federation.token.clone(),
            },
            retries: 0,
        };

        loop {
            let frame = tokio::select! {
                _ = self.closer.cancelled() => break,
                next = tokio::time::timeout(PONG_TIMEOUT, stream.next()) => match next {
                    Err(_) => {
                        warn!(url = %self.url, "federation connection timed out waiting for frames");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        warn!(url = %self.url, error = %err, "error reading from federation connection");
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                },
            };

            // Pongs, pings and other control frames refresh the read
            // deadline simply by arriving.
            let Message::Text(text) = frame else { continue };

            let msg: ServerMessage = match serde_json::from_str(text.as_str()) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(url = %self.url, error = %err, "discarding unparseable federation frame");
                    continue;
                }
            };

            state = match self.dispatch(state, &mut hello, msg).await {
                Ok(next) => next,
                Err(err) => {
                    self.close_with_error(err).await;
                    return;
                }
            };
        }

        self.close().await;
    }

    async fn dispatch(
        &self,
        state: HandshakeState,
        hello: &mut HelloExchange,
        msg: ServerMessage,
    ) -> Result<HandshakeState, FederationError> {
        match state {
            HandshakeState::WaitWelcome => {
                if msg.kind == "welcome" {
                    self.process_welcome(&msg, hello).await?;
                    Ok(HandshakeState::WaitHelloResponse)
                } else {
                    // Peers predating the welcome phase answer the upgrade
                    // with hello traffic directly.
                    self.process_hello_reply(msg, hello).await
                }
            }
            HandshakeState::WaitHelloResponse => self.process_hello_reply(msg, hello).await,
            HandshakeState::WaitRoomResponse => {
                // Peers commonly pipeline room events ahead of the join
                // ack; relay everything, advance on the ack itself.
                let established = msg.kind == "room";
                self.relay(msg);
                Ok(if established {
                    HandshakeState::Established
                } else {
                    HandshakeState::WaitRoomResponse
                })
            }
            HandshakeState::Established => {
                self.relay(msg);
                Ok(HandshakeState::Established)
            }
        }
    }

    async fn process_welcome(
        &self,
        msg: &ServerMessage,
        hello: &mut HelloExchange,
    ) -> Result<(), FederationError> {
        let supported = msg
            .welcome
            .as_ref()
            .is_some_and(|welcome| welcome.has_feature(FEATURE_FEDERATION));
        if !supported {
            return Err(FederationError::Unsupported);
        }
        self.send_hello(hello).await
    }

    async fn process_hello_reply(
        &self,
        msg: ServerMessage,
        hello: &mut HelloExchange,
    ) -> Result<HandshakeState, FederationError> {
        let matches = hello.msg_id.is_some() && hello.msg_id == msg.id;
        if !matches {
            debug!(
                url = %self.url,
                id = ?msg.id,
                kind = %msg.kind,
                "hello reply for unknown request, resending hello"
            );
            self.retry_hello(hello).await?;
            return Ok(HandshakeState::WaitHelloResponse);
        }

        hello.msg_id = None;
        match msg.kind.as_str() {
            "error" => {
                let error = msg.error.unwrap_or_else(|| {
                    SignalingError::new(ERROR_FEDERATION_ERROR, "the remote server rejected the hello")
                });
                Err(FederationError::Remote(error))
            }
            "hello" => {
                let remote = msg.hello.ok_or_else(|| {
                    FederationError::Handshake("hello response without hello payload".into())
                })?;
                info!(
                    url = %self.url,
                    session = %self.session.public_id(),
                    remote_session = %remote.session_id,
                    "federation session established"
                );
                let _ = self.remote_hello.set(remote);
                self.join_room().await?;
                Ok(HandshakeState::WaitRoomResponse)
            }
            other => {
                debug!(url = %self.url, kind = %other, "unexpected hello reply, resending hello");
                self.retry_hello(hello).await?;
                Ok(HandshakeState::WaitHelloResponse)
            }
        }
    }

    async fn retry_hello(&self, hello: &mut HelloExchange) -> Result<(), FederationError> {
        if hello.retries >= MAX_HELLO_RETRIES {
            return Err(FederationError::Handshake("too many hello retries".into()));
        }
        hello.retries += 1;
        self.send_hello(hello).await
    }

    /// Send the authenticated hello with a fresh correlation id.
    async fn send_hello(&self, hello: &mut HelloExchange) -> Result<(), FederationError> {
        let msg_id = random_string(8);
        hello.msg_id = Some(msg_id.clone());
        self.send_message(&ClientMessage {
            id: Some(msg_id),
            kind: "hello".into(),
            hello: Some(HelloClientMessage {
                version: HELLO_VERSION.into(),
                auth: HelloClientAuth {
                    kind: HELLO_AUTH_TYPE_FEDERATION.into(),
                    url: Some(self.federation.nextcloud_url.clone()),
                    params: serde_json::to_value(&hello.auth)?,
                },
            }),
            ..Default::default()
        })
        .await
    }

    /// Join the remote room, echoing the client's original correlation id
    /// so the peer's ack doubles as the join ack the client is waiting for.
    async fn join_room(&self) -> Result<(), FederationError> {
        let room_id = self
            .federation
            .room_id
            .clone()
            .unwrap_or_else(|| self.room_id.clone());
        self.send_message(&ClientMessage {
            id: self.join_id.clone(),
            kind: "room".into(),
            room: Some(RoomClientMessage {
                room_id,
                session_id: Some(self.room_session_id.clone()),
                federation: None,
            }),
            ..Default::default()
        })
        .await
    }

    /// Deliver a peer frame to the primary session, unmasking targeted
    /// messages addressed to this tunnel's remote identity.
    fn relay(&self, mut msg: ServerMessage) {
        if msg.kind == "message" {
            if let (Some(payload), Some(hello)) = (msg.message.as_mut(), self.remote_hello.get()) {
                if let Some(recipient) = payload.recipient.as_mut() {
                    if recipient.kind == RecipientKind::Session
                        && recipient.session_id.as_deref() == Some(hello.session_id.as_str())
                    {
                        recipient.session_id = Some(self.session.public_id());
                    }
                }
            }
        }
        self.session.send_message(msg);
    }

    async fn write_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PING_PERIOD);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.send_ping().await {
                        self.close().await;
                        return;
                    }
                }
            }
        }
    }

    /// Emit a keepalive ping stamped with the current timestamp.
    async fn send_ping(&self) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return false;
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .to_string();
        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Ping(now.into_bytes().into())))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(
                    url = %self.url,
                    session = %self.session.public_id(),
                    error = %err,
                    "could not send ping to federated server"
                );
                false
            }
            Err(_) => {
                warn!(
                    url = %self.url,
                    session = %self.session.public_id(),
                    "timed out sending ping to federated server"
                );
                false
            }
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
