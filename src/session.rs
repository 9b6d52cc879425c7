//! The session manager: one actor task owns the local media handle, the
//! signaling registration, and the peer session registry. The public
//! [`CallSession`] façade turns method calls into queued commands, so
//! device acquisition, registration, and call negotiation never interleave
//! with each other or with transport callbacks.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{SessionEvent, SessionSnapshot, StateEmitter};
use crate::identity::ParticipantIdentity;
use crate::media::{self, LocalMediaHandle, MediaDevices, TrackKind};
use crate::peer::{PeerSession, PeerSessionRegistry, SessionPhase};
use crate::render::{InteractionBus, RenderBinding, SinkFactory, SinkKind, SinkSource};
use crate::signaling::{CallEvent, CallHandle, PendingCall, SignalingBackend};

/// External capabilities injected into the session manager.
#[derive(Clone)]
pub struct Capabilities {
    pub devices: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingBackend>,
    pub sinks: Arc<dyn SinkFactory>,
}

const COMMAND_BUFFER: usize = 16;
const PEER_EVENT_BUFFER: usize = 64;

enum Command {
    Connect {
        display_name: String,
        video: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ConnectTo {
        address: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    SetVolume {
        volume: f32,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

struct PeerEvent {
    epoch: u64,
    address: String,
    event: CallEvent,
}

/// Handle to a running session manager. Cloning is cheap; dropping the
/// last clone tears the session down.
#[derive(Clone)]
pub struct CallSession {
    cmd_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    interactions: Arc<InteractionBus>,
}

impl CallSession {
    /// Spawn the session actor on the current tokio runtime.
    pub fn spawn(caps: Capabilities, config: SessionConfig) -> Self {
        let interactions = Arc::new(InteractionBus::new());
        let initial =
            SessionSnapshot::disconnected(config.start_muted, config.volume.clamp(0.0, 1.0));
        let (emitter, snapshot_rx, events) = StateEmitter::new(initial);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_BUFFER);

        let actor = SessionActor {
            caps,
            volume: config.volume.clamp(0.0, 1.0),
            config,
            emitter,
            interactions: interactions.clone(),
            cmd_rx,
            peer_tx,
            peer_rx,
            incoming_rx: None,
            active: None,
            epoch: 0,
        };
        tokio::spawn(actor.run());

        CallSession {
            cmd_tx,
            snapshot_rx,
            events,
            interactions,
        }
    }

    /// Acquire local media, register a fresh signaling address, and start
    /// accepting calls. Fails without side effects: a device error stops
    /// before registration, a registration error releases the media first.
    pub async fn connect(&self, display_name: &str, video: bool) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect {
            display_name: display_name.to_string(),
            video,
            reply,
        })
        .await
    }

    /// Tear everything down: peer sessions, then the signaling
    /// registration, then the hardware tracks. A no-op when disconnected.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Place an outbound call to a known remote address.
    pub async fn connect_to(&self, address: &str) -> Result<(), SessionError> {
        self.request(|reply| Command::ConnectTo {
            address: address.to_string(),
            reply,
        })
        .await
    }

    /// Flip the microphone. Returns the new muted state; unchanged (and
    /// side-effect free) while disconnected.
    pub async fn toggle_mute(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Flip the camera. Returns the new enabled state.
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    /// Set remote audio playout volume, clamped to `0.0..=1.0`.
    pub async fn set_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.request(|reply| Command::SetVolume { volume, reply }).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch every snapshot change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to discrete transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Where the embedding UI forwards user gestures (for blocked-playback
    /// retries).
    pub fn interactions(&self) -> &Arc<InteractionBus> {
        &self.interactions
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().connected
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }
}

/// State that only exists while connected.
struct Active {
    identity: ParticipantIdentity,
    local: LocalMediaHandle,
    connection: Box<dyn crate::signaling::SignalingConnection>,
    registry: PeerSessionRegistry,
    preview: Option<RenderBinding>,
    muted: bool,
    video_enabled: bool,
}

enum Input {
    Command(Option<Command>),
    Offer(Box<dyn PendingCall>),
    OffersClosed,
    Peer(PeerEvent),
}

struct SessionActor {
    caps: Capabilities,
    config: SessionConfig,
    emitter: StateEmitter,
    interactions: Arc<InteractionBus>,
    cmd_rx: mpsc::Receiver<Command>,
    peer_tx: mpsc::Sender<PeerEvent>,
    peer_rx: mpsc::Receiver<PeerEvent>,
    incoming_rx: Option<mpsc::Receiver<Box<dyn PendingCall>>>,
    active: Option<Active>,
    /// Bumped per registration; events tagged with an older epoch are
    /// from a torn-down connection and ignored.
    epoch: u64,
    volume: f32,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            match self.next_input().await {
                Input::Command(None) => {
                    // Last façade handle dropped: leak-free shutdown.
                    self.teardown().await;
                    break;
                }
                Input::Command(Some(cmd)) => self.handle_command(cmd).await,
                Input::Offer(pending) => self.handle_offer(pending).await,
                Input::OffersClosed => self.incoming_rx = None,
                Input::Peer(event) => self.handle_peer_event(event),
            }
        }
    }

    async fn next_input(&mut self) -> Input {
        tokio::select! {
            cmd = self.cmd_rx.recv() => Input::Command(cmd),
            Some(event) = self.peer_rx.recv() => Input::Peer(event),
            offer = async {
                match self.incoming_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match offer {
                Some(pending) => Input::Offer(pending),
                None => Input::OffersClosed,
            },
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect {
                display_name,
                video,
                reply,
            } => {
                let _ = reply.send(self.connect(&display_name, video).await);
            }
            Command::Disconnect { reply } => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
            }
            Command::ConnectTo { address, reply } => {
                let _ = reply.send(self.connect_to(&address).await);
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(Ok(self.toggle_mute()));
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(Ok(self.toggle_video()));
            }
            Command::SetVolume { volume, reply } => {
                self.set_volume(volume);
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn connect(&mut self, display_name: &str, video: bool) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        // Media first: a denied permission must stop us before any
        // signaling traffic happens.
        let local = media::acquire(&*self.caps.devices, &self.config.constraints, video).await?;

        let muted = self.config.start_muted;
        local.set_kind_enabled(TrackKind::Audio, !muted);

        let identity = ParticipantIdentity::allocate(display_name);
        let mut connection = match self.caps.signaling.register(identity.address()).await {
            Ok(connection) => connection,
            Err(err) => {
                // Never leak an open device when signaling fails after
                // acquisition.
                local.release();
                return Err(err.into());
            }
        };

        self.epoch += 1;
        self.incoming_rx = connection.take_incoming();
        if self.incoming_rx.is_none() {
            tracing::warn!("signaling connection exposes no incoming-call stream");
        }

        let registry = PeerSessionRegistry::new(
            self.caps.sinks.clone(),
            self.interactions.clone(),
            self.volume,
        );

        let preview = local.has_video().then(|| {
            let sink = self.caps.sinks.create(SinkKind::LocalPreview, identity.address());
            RenderBinding::bind(
                SinkKind::LocalPreview,
                identity.address(),
                sink,
                SinkSource::Local(local.tracks().to_vec()),
                self.interactions.clone(),
            )
        });

        let video_enabled = local.has_video();
        let quality = local.capture_quality();
        let address = identity.address().to_string();
        tracing::info!(%address, video = video_enabled, "connected to signaling");

        self.active = Some(Active {
            identity,
            local,
            connection,
            registry,
            preview,
            muted,
            video_enabled,
        });

        self.emitter.update(|snap| {
            snap.connected = true;
            snap.muted = muted;
            snap.video_enabled = video_enabled;
            snap.capture_quality = quality;
            snap.participants = vec![address.clone()];
        });
        self.emitter.emit(SessionEvent::Connected { address });
        Ok(())
    }

    /// Strict teardown order: peer sessions, then the registration, then
    /// the hardware tracks. Safe to run when already disconnected.
    async fn teardown(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.incoming_rx = None;

        if let Some(preview) = active.preview.take() {
            preview.unbind();
        }
        active.registry.close_all();
        active.connection.destroy().await;
        active.local.release();
        tracing::info!(address = %active.identity.address(), "disconnected");

        let muted = self.config.start_muted;
        let volume = self.volume;
        self.emitter
            .update(|snap| *snap = SessionSnapshot::disconnected(muted, volume));
        self.emitter.emit(SessionEvent::Disconnected);
    }

    async fn connect_to(&mut self, address: &str) -> Result<(), SessionError> {
        let peer_tx = self.peer_tx.clone();
        let epoch = self.epoch;
        let Some(active) = self.active.as_mut() else {
            return Err(SessionError::NoLocalMedia);
        };

        let mut call = active.connection.call(address, &active.local).await?;
        forward_call_events(peer_tx, epoch, &mut call);
        active.registry.install(PeerSession::negotiating(call));
        self.sync_roster();
        Ok(())
    }

    async fn handle_offer(&mut self, pending: Box<dyn PendingCall>) {
        let peer_tx = self.peer_tx.clone();
        let epoch = self.epoch;
        let Some(active) = self.active.as_mut() else {
            // Offer raced with teardown; nothing to answer with.
            return;
        };

        let caller = pending.caller().to_string();
        tracing::debug!(peer = %caller, "answering inbound call");
        match pending.answer(&active.local).await {
            Ok(mut call) => {
                forward_call_events(peer_tx, epoch, &mut call);
                active.registry.install(PeerSession::negotiating(call));
                self.sync_roster();
            }
            Err(err) => {
                // Per-peer failure; the rest of the mesh is unaffected.
                tracing::warn!(peer = %caller, %err, "failed to answer inbound call");
            }
        }
    }

    fn handle_peer_event(&mut self, incoming: PeerEvent) {
        let PeerEvent {
            epoch,
            address,
            event,
        } = incoming;
        if epoch != self.epoch {
            tracing::debug!(peer = %address, "event from torn-down registration ignored");
            return;
        }

        match event {
            CallEvent::Stream(remote) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if active.registry.attach_stream(&address, remote) {
                    self.sync_roster();
                    self.emitter.emit(SessionEvent::PeerJoined { address });
                }
            }
            CallEvent::Failed(reason) => {
                tracing::warn!(peer = %address, %reason, "call failed");
                self.remove_peer(address);
            }
            CallEvent::Closed => self.remove_peer(address),
        }
    }

    fn remove_peer(&mut self, address: String) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(phase) = active.registry.remove(&address) {
            // Roster and session set move together, in this same handler,
            // before anything else can observe them.
            self.sync_roster();
            if phase == SessionPhase::Active {
                self.emitter.emit(SessionEvent::PeerLeft { address });
            }
        }
    }

    fn toggle_mute(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return self.emitter.snapshot().muted;
        };
        active.muted = !active.muted;
        active
            .local
            .set_kind_enabled(TrackKind::Audio, !active.muted);
        let muted = active.muted;
        self.emitter.update(|snap| snap.muted = muted);
        self.emitter.emit(SessionEvent::MuteChanged { muted });
        muted
    }

    fn toggle_video(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return self.emitter.snapshot().video_enabled;
        };
        active.video_enabled = !active.video_enabled;
        active
            .local
            .set_kind_enabled(TrackKind::Video, active.video_enabled);
        let enabled = active.video_enabled;
        self.emitter.update(|snap| snap.video_enabled = enabled);
        self.emitter.emit(SessionEvent::VideoChanged { enabled });
        enabled
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(active) = self.active.as_mut() {
            active.registry.set_volume(self.volume);
        }
        let volume = self.volume;
        self.emitter.update(|snap| snap.volume = volume);
    }

    fn sync_roster(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let roster = active.registry.roster(active.identity.address());
        self.emitter.update(|snap| snap.participants = roster);
    }
}

/// Pump one call's events into the actor queue, tagged with address and
/// registration epoch. The forwarder dies with the call or the actor.
fn forward_call_events(
    peer_tx: mpsc::Sender<PeerEvent>,
    epoch: u64,
    call: &mut Box<dyn CallHandle>,
) {
    let Some(mut events) = call.take_events() else {
        tracing::warn!(peer = call.remote_address(), "call handle exposes no event stream");
        return;
    };
    let address = call.remote_address().to_string();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let forwarded = PeerEvent {
                epoch,
                address: address.clone(),
                event,
            };
            if peer_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    });
}
