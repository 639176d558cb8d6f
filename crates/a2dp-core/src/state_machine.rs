//! Per-peer connection state machine.
//!
//! ```text
//!                 CONNECT / incoming accepted
//!   Disconnected ---------------------------> Connecting ----CONNECTED----> Connected
//!        ^  ^                                   |   |                        |   |
//!        |  +---- DISCONNECTED / DISCONNECT ----+   +---- DISCONNECTING --+  |   |
//!        |        / timeout                                               v  v   |
//!        +---------------- DISCONNECTED / timeout ------------------ Disconnecting
//!                                                  (DISCONNECT) <------------+
//! ```
//!
//! Each machine owns one [`PeerConnection`] and processes its messages one at
//! a time. Local CONNECT requests that arrive mid-transition are deferred and
//! replayed once the machine settles; a DISCONNECT while Connecting cancels
//! the attempt outright. Connecting and Disconnecting are guarded by a
//! timeout that forces a native disconnect and a synthetic DISCONNECTED
//! event, so a machine can never wedge in a transient state.
//!
//! The machine never calls back into the service. Everything the service
//! needs to react to is sent outward as a [`MachineNotice`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use a2dp_types::{AudioState, CodecStatus, ConnectionState, PeerId, PlayingState};

use crate::events::{EngineEvent, EventBroadcaster};
use crate::peer::{Command, SharedPeer, lock_peer};
use crate::traits::NativeStack;

/// Asynchronous event reported by the native stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackEvent {
    /// The profile connection moved to a new state.
    ConnectionStateChanged { peer: PeerId, state: ConnectionState },
    /// Streaming started, stopped or was suspended by the peer.
    AudioStateChanged { peer: PeerId, state: AudioState },
    /// The negotiated codec configuration changed.
    CodecConfigChanged { peer: PeerId, status: CodecStatus },
}

impl StackEvent {
    /// The peer the native stack tagged this event with.
    pub fn peer(&self) -> PeerId {
        match self {
            Self::ConnectionStateChanged { peer, .. }
            | Self::AudioStateChanged { peer, .. }
            | Self::CodecConfigChanged { peer, .. } => *peer,
        }
    }
}

/// A unit of work for a state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Local request.
    Command(Command),
    /// Event from the native stack.
    Stack(StackEvent),
    /// The connect/disconnect timeout elapsed.
    ConnectTimeout,
}

/// Decides whether a peer-initiated connection may proceed.
pub trait IncomingGate: Send + Sync {
    fn accept_incoming(&self, peer: &PeerId) -> bool;
}

impl<F> IncomingGate for F
where
    F: Fn(&PeerId) -> bool + Send + Sync,
{
    fn accept_incoming(&self, peer: &PeerId) -> bool {
        self(peer)
    }
}

/// Outward notification from a machine to the service reactor.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineNotice {
    /// A transition completed.
    ConnectionStateChanged {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Streaming started or stopped.
    PlayingStateChanged { peer: PeerId, playing: bool },
    /// A new codec status was recorded.
    CodecConfigChanged {
        peer: PeerId,
        status: CodecStatus,
        same_feeding_parameters: bool,
    },
}

/// Everything a machine needs from the outside world.
pub struct MachineContext {
    pub native: Arc<dyn NativeStack>,
    pub gate: Arc<dyn IncomingGate>,
    pub events: EventBroadcaster,
    pub notices: mpsc::UnboundedSender<MachineNotice>,
    pub connect_timeout: Duration,
    pub offload_enabled: bool,
}

/// The state machine for one remote peer.
pub struct ConnectionStateMachine {
    peer: PeerId,
    record: SharedPeer,
    ctx: Arc<MachineContext>,
    deadline: Option<Instant>,
    /// Replayed and self-posted messages; drained before the next mailbox message.
    pending: VecDeque<Message>,
}

impl ConnectionStateMachine {
    /// Create a machine for the peer behind `record`, starting Disconnected.
    pub fn new(record: SharedPeer, ctx: Arc<MachineContext>) -> Self {
        let peer = lock_peer(&record).identity();
        Self {
            peer,
            record,
            ctx,
            deadline: None,
            pending: VecDeque::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        lock_peer(&self.record).connection_state
    }

    /// When the pending connect/disconnect timeout fires, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Process a message and every message it replays or self-posts.
    pub fn process(&mut self, message: Message) {
        self.handle(message);
        while let Some(next) = self.pending.pop_front() {
            self.handle(next);
        }
    }

    fn handle(&mut self, message: Message) {
        let state = self.state();
        match message {
            Message::Command(command) => self.on_command(state, command),
            Message::Stack(event) => {
                if event.peer() != self.peer {
                    error!(
                        "[{}] {}: event for {} does not match this machine, processing anyway",
                        self.peer,
                        state,
                        event.peer()
                    );
                }
                self.on_stack_event(state, event);
            }
            Message::ConnectTimeout => self.on_timeout(state),
        }
    }

    fn on_command(&mut self, state: ConnectionState, command: Command) {
        let peer = self.peer;
        match (state, command) {
            (ConnectionState::Disconnected, Command::Connect) => {
                info!("[{peer}] Disconnected: connecting");
                lock_peer(&self.record).release_slot();
                if !self.ctx.native.connect_peer(&peer) {
                    error!("[{peer}] Disconnected: native connect failed");
                    self.broadcast_connection_state(
                        ConnectionState::Disconnected,
                        ConnectionState::Disconnected,
                    );
                    return;
                }
                self.transition_to(ConnectionState::Connecting);
            }
            (ConnectionState::Disconnected, Command::Disconnect) => {
                debug!("[{peer}] Disconnected: ignoring disconnect");
            }
            (ConnectionState::Connecting, Command::Disconnect) => {
                info!("[{peer}] Connecting: cancelling connection");
                if !self.ctx.native.disconnect_peer(&peer) {
                    warn!("[{peer}] Connecting: native disconnect failed");
                }
                self.transition_to(ConnectionState::Disconnected);
            }
            (ConnectionState::Connecting | ConnectionState::Disconnecting, command) => {
                let queued = lock_peer(&self.record).defer(command);
                if queued {
                    debug!("[{peer}] {state}: deferring {command:?}");
                } else {
                    debug!("[{peer}] {state}: {command:?} already deferred");
                }
            }
            (ConnectionState::Connected, Command::Connect) => {
                warn!("[{peer}] Connected: already connected");
                lock_peer(&self.record).release_slot();
            }
            (ConnectionState::Connected, Command::Disconnect) => {
                info!("[{peer}] Connected: disconnecting");
                if self.ctx.native.disconnect_peer(&peer) {
                    self.transition_to(ConnectionState::Disconnecting);
                } else {
                    error!("[{peer}] Connected: native disconnect failed");
                    self.transition_to(ConnectionState::Disconnected);
                }
            }
        }
    }

    fn on_stack_event(&mut self, state: ConnectionState, event: StackEvent) {
        match event {
            StackEvent::ConnectionStateChanged {
                state: reported, ..
            } => self.on_connection_event(state, reported),
            StackEvent::AudioStateChanged { state: audio, .. } => self.on_audio_event(state, audio),
            StackEvent::CodecConfigChanged { status, .. } => self.on_codec_event(state, status),
        }
    }

    fn on_connection_event(&mut self, state: ConnectionState, reported: ConnectionState) {
        use ConnectionState::*;

        let peer = self.peer;
        match (state, reported) {
            (Disconnected, Connecting | Connected) => {
                if self.ctx.gate.accept_incoming(&peer) {
                    info!("[{peer}] Disconnected: accepting incoming {reported}");
                    self.transition_to(reported);
                } else {
                    warn!("[{peer}] Disconnected: rejecting incoming {reported}");
                    if !self.ctx.native.disconnect_peer(&peer) {
                        error!("[{peer}] Disconnected: native disconnect failed");
                    }
                }
            }
            (Disconnecting, Connecting | Connected) => {
                if self.ctx.gate.accept_incoming(&peer) {
                    info!("[{peer}] Disconnecting: peer reconnected ({reported})");
                    self.transition_to(reported);
                } else {
                    warn!("[{peer}] Disconnecting: rejecting {reported}");
                    if !self.ctx.native.disconnect_peer(&peer) {
                        error!("[{peer}] Disconnecting: native disconnect failed");
                    }
                }
            }
            (Connecting, Connected | Disconnecting)
            | (Connected, Disconnecting)
            | (Connecting | Connected | Disconnecting, Disconnected) => {
                self.transition_to(reported);
            }
            (_, _) => {
                debug!("[{peer}] {state}: ignoring {reported} event");
            }
        }
    }

    fn on_audio_event(&mut self, state: ConnectionState, audio: AudioState) {
        let peer = self.peer;
        if state != ConnectionState::Connected {
            debug!("[{peer}] {state}: ignoring audio {audio:?}");
            return;
        }
        let playing = matches!(audio, AudioState::Started);
        let changed = {
            let mut record = lock_peer(&self.record);
            if record.is_playing == playing {
                false
            } else {
                record.is_playing = playing;
                true
            }
        };
        if changed {
            let what = if playing {
                "started playing"
            } else {
                "stopped playing"
            };
            info!("[{peer}] Connected: {what}");
            self.notify_playing(playing);
        }
    }

    fn on_codec_event(&mut self, state: ConnectionState, status: CodecStatus) {
        let peer = self.peer;
        let previous = {
            let mut record = lock_peer(&self.record);
            if record.codec_status.as_ref() == Some(&status) {
                debug!("[{peer}] {state}: codec status unchanged");
                return;
            }
            record.codec_status.replace(status.clone())
        };

        let mut same_feeding_parameters = previous
            .as_ref()
            .is_some_and(|prev| status.config.same_audio_feeding_parameters(&prev.config));

        if self.ctx.offload_enabled
            && let Some(prev) = previous.as_ref()
            && (prev.config.codec_type != status.config.codec_type
                || prev.config.codec_specific != status.config.codec_specific)
        {
            // The offloaded encoder must be restarted for any codec swap.
            same_feeding_parameters = false;
        }

        debug!(
            "[{peer}] {state}: codec now {:?} (same feeding parameters: {same_feeding_parameters})",
            status.config.codec_type
        );
        let _ = self.ctx.notices.send(MachineNotice::CodecConfigChanged {
            peer,
            status,
            same_feeding_parameters,
        });
    }

    fn on_timeout(&mut self, state: ConnectionState) {
        let peer = self.peer;
        self.deadline = None;
        if !state.is_transient() {
            debug!("[{peer}] {state}: stale timeout");
            return;
        }
        warn!("[{peer}] {state}: connection timeout");
        if !self.ctx.native.disconnect_peer(&peer) {
            error!("[{peer}] {state}: native disconnect failed");
        }
        self.pending
            .push_back(Message::Stack(StackEvent::ConnectionStateChanged {
                peer,
                state: ConnectionState::Disconnected,
            }));
    }

    fn transition_to(&mut self, to: ConnectionState) {
        let peer = self.peer;
        let from = self.state();
        if from == to {
            return;
        }

        // Leaving a state: cancel its timeout and stop any stream first.
        if from.is_transient() {
            self.deadline = None;
        }
        let was_playing = {
            let mut record = lock_peer(&self.record);
            std::mem::replace(&mut record.is_playing, false)
        };
        if was_playing {
            info!("[{peer}] {from}: stopped playing");
            self.notify_playing(false);
        }

        let replay = {
            let mut record = lock_peer(&self.record);
            record.last_connection_state = Some(from);
            record.connection_state = to;
            record.last_transition_at = Some(OffsetDateTime::now_utc());
            if to.is_connecting_or_connected() {
                record.release_slot();
            }
            if to == ConnectionState::Connected {
                record.remove_deferred(Command::Connect);
            }
            if to.is_transient() {
                VecDeque::new()
            } else {
                record.take_deferred()
            }
        };
        info!("[{peer}] {from} -> {to}");

        if to.is_transient() {
            self.deadline = Some(Instant::now() + self.ctx.connect_timeout);
        }

        self.broadcast_connection_state(to, from);
        let _ = self
            .ctx
            .notices
            .send(MachineNotice::ConnectionStateChanged { peer, from, to });

        if to == ConnectionState::Connected {
            // Listeners reset to a stopped stream on every new connection.
            self.ctx.events.send(EngineEvent::PlayingStateChanged {
                peer,
                state: PlayingState::NotPlaying,
                previous: PlayingState::Playing,
            });
        }

        for command in replay.into_iter().rev() {
            debug!("[{peer}] {to}: replaying deferred {command:?}");
            self.pending.push_front(Message::Command(command));
        }
    }

    fn notify_playing(&self, playing: bool) {
        let _ = self.ctx.notices.send(MachineNotice::PlayingStateChanged {
            peer: self.peer,
            playing,
        });
        self.ctx.events.send(EngineEvent::PlayingStateChanged {
            peer: self.peer,
            state: PlayingState::from_playing(playing),
            previous: PlayingState::from_playing(!playing),
        });
    }

    fn broadcast_connection_state(&self, state: ConnectionState, previous: ConnectionState) {
        self.ctx.events.send(EngineEvent::ConnectionStateChanged {
            peer: self.peer,
            state,
            previous,
        });
    }
}

/// Mailbox entry for a running machine.
#[derive(Debug)]
pub(crate) enum Envelope {
    Message(Message),
    /// Reply with the number of messages processed so far.
    Flush(oneshot::Sender<u64>),
}

/// Drive a machine from its mailbox until cancelled or the mailbox closes.
///
/// Messages are processed strictly in arrival order; the timeout is checked
/// before each mailbox read so an expired deadline is never starved.
pub(crate) async fn run_machine(
    mut machine: ConnectionStateMachine,
    mut mailbox: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    let peer = machine.peer();
    let mut processed: u64 = 0;
    debug!("[{peer}] state machine started");

    loop {
        let deadline = machine.deadline();
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = timeout => {
                machine.process(Message::ConnectTimeout);
                processed += 1;
            }
            envelope = mailbox.recv() => match envelope {
                Some(Envelope::Message(message)) => {
                    machine.process(message);
                    processed += 1;
                }
                Some(Envelope::Flush(reply)) => {
                    let _ = reply.send(processed);
                }
                None => break,
            },
        }
    }

    debug!("[{peer}] state machine stopped");
}
