//! The socket task behind [`PhoenixTransport`](super::PhoenixTransport).
//!
//! One task owns the WebSocket and every channel joined over it. Commands
//! arrive from the transport handle; events leave through each channel's
//! [`ChannelEventSender`]. The socket is opened lazily on the first join and
//! reopened on the next join after it drops.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::channel::types::{ChannelId, ChannelStatus};
use crate::message::presence::PresenceState;
use crate::message::types::ChannelEvent;
use crate::transport::{ChannelEventSender, ChannelRequest};

use super::PhoenixConfig;
use super::frame::{Frame, PHOENIX_TOPIC, TOPIC_PREFIX, events};
use super::heartbeat::{HeartbeatAction, HeartbeatMonitor};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Requests from the transport handle.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    Join {
        id: ChannelId,
        request: ChannelRequest,
        events: ChannelEventSender,
    },
    Leave {
        id: ChannelId,
    },
}

#[derive(Debug, Error)]
pub(crate) enum SocketError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

/// Why the connected loop returned.
enum Disconnect {
    /// The socket dropped; wait for the next join.
    Lost,
    /// The transport handle is gone.
    Shutdown,
}

struct JoinedChannel {
    topic: String,
    request: ChannelRequest,
    events: ChannelEventSender,
    join_ref: Option<String>,
    join_deadline: Option<Instant>,
    joined: bool,
    presence: PresenceState,
}

impl JoinedChannel {
    fn new(request: ChannelRequest, events: ChannelEventSender) -> Self {
        Self {
            topic: format!("{TOPIC_PREFIX}{}", request.topic),
            request,
            events,
            join_ref: None,
            join_deadline: None,
            joined: false,
            presence: PresenceState::new(),
        }
    }

    fn prepare_join(&mut self, join_ref: String, deadline: Instant, token: Option<&str>) -> Frame {
        let frame = Frame::join(&self.topic, &join_ref, &self.request, token);
        self.join_ref = Some(join_ref);
        self.join_deadline = Some(deadline);
        frame
    }

    fn emit(&self, event: ChannelEvent) {
        if !self.events.send(event) {
            trace!(channel = %self.events.channel_id(), "Event for released channel");
        }
    }

    fn emit_status(&self, status: ChannelStatus) {
        self.emit(ChannelEvent::Status(status));
    }
}

pub(crate) struct SocketActor {
    config: PhoenixConfig,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    channels: HashMap<ChannelId, JoinedChannel>,
    next_ref: u64,
}

impl SocketActor {
    pub fn new(config: PhoenixConfig, commands: mpsc::UnboundedReceiver<SocketCommand>) -> Self {
        Self {
            config,
            commands,
            channels: HashMap::new(),
            next_ref: 0,
        }
    }

    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if !self.apply_offline(command) {
                continue;
            }

            match self.connect().await {
                Ok(ws) => {
                    info!(endpoint = %self.config.endpoint, "Realtime socket connected");
                    if let Disconnect::Shutdown = self.run_connected(ws).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, endpoint = %self.config.endpoint, "Realtime socket connect failed");
                    let status = match e {
                        SocketError::ConnectTimeout(_) => ChannelStatus::TimedOut,
                        _ => ChannelStatus::ChannelError,
                    };
                    self.fail_all(status);
                }
            }
        }

        debug!("Realtime socket task stopped");
    }

    /// Apply a command while no socket is open. Returns `true` if a socket
    /// is now needed.
    fn apply_offline(&mut self, command: SocketCommand) -> bool {
        match command {
            SocketCommand::Join {
                id,
                request,
                events,
            } => {
                self.channels.insert(id, JoinedChannel::new(request, events));
                true
            }
            SocketCommand::Leave { id } => {
                self.channels.remove(&id);
                false
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, SocketError> {
        let url = self.config.socket_url();
        let timeout = self.config.join_timeout;
        match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(result) => {
                let (ws, _response) = result?;
                Ok(ws)
            }
            Err(_) => Err(SocketError::ConnectTimeout(timeout)),
        }
    }

    async fn run_connected(&mut self, ws: WsStream) -> Disconnect {
        let (mut sink, mut source) = ws.split();
        match self.session(&mut sink, &mut source).await {
            Ok(Disconnect::Shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                self.channels.clear();
                Disconnect::Shutdown
            }
            Ok(Disconnect::Lost) => Disconnect::Lost,
            Err(e) => {
                warn!(error = %e, "Realtime socket failed");
                self.fail_all(ChannelStatus::ChannelError);
                Disconnect::Lost
            }
        }
    }

    async fn session(
        &mut self,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> Result<Disconnect, SocketError> {
        self.join_pending(sink).await?;

        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = HeartbeatMonitor::new();

        loop {
            let deadline = self.next_join_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(Disconnect::Shutdown);
                    };
                    self.apply_online(command, sink).await?;
                }
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), &mut heartbeat),
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "Realtime socket closed by server");
                            self.fail_all(ChannelStatus::ChannelError);
                            return Ok(Disconnect::Lost);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            info!("Realtime socket stream ended");
                            self.fail_all(ChannelStatus::ChannelError);
                            return Ok(Disconnect::Lost);
                        }
                    }
                }
                _ = ticker.tick() => {
                    let reference = self.make_ref();
                    match heartbeat.tick(reference) {
                        HeartbeatAction::Send(frame) => send_frame(sink, &frame).await?,
                        HeartbeatAction::TimedOut => {
                            warn!("Realtime heartbeat not acknowledged");
                            self.fail_all(ChannelStatus::TimedOut);
                            let _ = sink.close().await;
                            return Ok(Disconnect::Lost);
                        }
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    self.expire_joins(sink).await?;
                }
            }
        }
    }

    async fn join_pending(&mut self, sink: &mut WsSink) -> Result<(), SocketError> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            let join_ref = self.make_ref();
            let deadline = Instant::now() + self.config.join_timeout;
            let token = self.config.access_token.as_deref();
            let Some(channel) = self.channels.get_mut(&id) else {
                continue;
            };
            let frame = channel.prepare_join(join_ref, deadline, token);
            debug!(channel = %id, topic = %channel.topic, "Joining realtime channel");
            send_frame(sink, &frame).await?;
        }
        Ok(())
    }

    async fn apply_online(
        &mut self,
        command: SocketCommand,
        sink: &mut WsSink,
    ) -> Result<(), SocketError> {
        match command {
            SocketCommand::Join {
                id,
                request,
                events,
            } => {
                let mut channel = JoinedChannel::new(request, events);
                let join_ref = self.make_ref();
                let deadline = Instant::now() + self.config.join_timeout;
                let frame =
                    channel.prepare_join(join_ref, deadline, self.config.access_token.as_deref());
                debug!(channel = %id, topic = %channel.topic, "Joining realtime channel");
                self.channels.insert(id, channel);
                send_frame(sink, &frame).await
            }
            SocketCommand::Leave { id } => {
                let Some(channel) = self.channels.remove(&id) else {
                    return Ok(());
                };
                let Some(join_ref) = channel.join_ref else {
                    return Ok(());
                };
                debug!(channel = %id, topic = %channel.topic, "Leaving realtime channel");
                let frame = Frame::leave(&channel.topic, &join_ref, self.make_ref());
                send_frame(sink, &frame).await
            }
        }
    }

    fn handle_text(&mut self, text: &str, heartbeat: &mut HeartbeatMonitor) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Undecodable realtime frame");
                return;
            }
        };

        if frame.topic == PHOENIX_TOPIC {
            if frame.event == events::REPLY {
                if let Some(reference) = frame.reference.as_deref() {
                    heartbeat.acknowledge(reference);
                }
            }
            return;
        }

        let Some(id) = self.route(&frame) else {
            trace!(topic = %frame.topic, event = %frame.event, "Frame for unknown channel");
            return;
        };
        if self.dispatch(id, &frame) {
            self.channels.remove(&id);
        }
    }

    /// The channel a frame belongs to. Frames carrying a stale `join_ref`
    /// belong to nobody.
    fn route(&self, frame: &Frame) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, ch)| {
                ch.topic == frame.topic
                    && (frame.join_ref.is_none() || frame.join_ref == ch.join_ref)
            })
            .map(|(id, _)| *id)
    }

    /// Handle a channel frame. Returns `true` if the channel is finished.
    fn dispatch(&mut self, id: ChannelId, frame: &Frame) -> bool {
        let Some(channel) = self.channels.get_mut(&id) else {
            return false;
        };

        match frame.event.as_str() {
            events::REPLY => {
                if channel.joined || frame.reference.is_none() || frame.reference != channel.join_ref
                {
                    return false;
                }
                if frame.status() == Some("ok") {
                    channel.joined = true;
                    channel.join_deadline = None;
                    channel.emit_status(ChannelStatus::Subscribed);
                    false
                } else {
                    warn!(channel = %id, payload = %frame.payload, "Realtime join rejected");
                    channel.emit_status(ChannelStatus::ChannelError);
                    true
                }
            }
            events::ERROR => {
                channel.emit_status(ChannelStatus::ChannelError);
                true
            }
            events::CLOSE => {
                channel.emit_status(ChannelStatus::Closed);
                true
            }
            events::SYSTEM => {
                if frame.status() == Some("error") {
                    warn!(channel = %id, payload = %frame.payload, "Realtime system error");
                    channel.emit_status(ChannelStatus::ChannelError);
                    true
                } else {
                    false
                }
            }
            events::POSTGRES_CHANGES => {
                if let Some(record) = frame.insert_record() {
                    channel.emit(ChannelEvent::Insert(record));
                }
                false
            }
            events::PRESENCE_STATE => {
                channel.presence = PresenceState::from_wire(&frame.payload);
                channel.emit(ChannelEvent::PresenceSync(channel.presence.clone()));
                false
            }
            events::PRESENCE_DIFF => {
                channel.presence.apply_diff(&frame.payload);
                channel.emit(ChannelEvent::PresenceSync(channel.presence.clone()));
                false
            }
            other => {
                trace!(channel = %id, event = other, "Ignoring realtime event");
                false
            }
        }
    }

    fn next_join_deadline(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter(|ch| !ch.joined)
            .filter_map(|ch| ch.join_deadline)
            .min()
    }

    async fn expire_joins(&mut self, sink: &mut WsSink) -> Result<(), SocketError> {
        let now = Instant::now();
        let expired: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, ch)| !ch.joined && ch.join_deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(channel) = self.channels.remove(&id) else {
                continue;
            };
            warn!(channel = %id, topic = %channel.topic, "Realtime join timed out");
            channel.emit_status(ChannelStatus::TimedOut);
            if let Some(join_ref) = channel.join_ref.as_deref() {
                let frame = Frame::leave(&channel.topic, join_ref, self.make_ref());
                send_frame(sink, &frame).await?;
            }
        }
        Ok(())
    }

    /// Report `status` on every channel and forget them all.
    fn fail_all(&mut self, status: ChannelStatus) {
        for (_, channel) in self.channels.drain() {
            channel.emit_status(status.clone());
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), SocketError> {
    let text = frame.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
