//! webrtc-rs implementation of the signaling/call capability.
//!
//! Each call gets its own `RTCPeerConnection`. SDP and the full ICE
//! candidate set are exchanged as one compressed bundle per direction
//! (offer and answer) through a [`SignalChannel`], plus a `Bye` on hangup.
//! A dropped connection gets a grace period to recover before the call is
//! declared closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::error::{CallError, RegistrationError};
use crate::media::{
    LocalMediaHandle, RemoteMediaHandle, RemoteTrack, RemoteTrackSource, TrackKind, TrackSource,
};
use crate::signaling::{
    CallDirection, CallEvent, CallHandle, PendingCall, SignalingBackend, SignalingConnection,
};
use crate::transport::signal::{
    decode_bundle, encode_bundle, ConnectionBundle, IceCandidate, SdpPayload, SignalChannel,
    SignalEnvelope, SignalMessage,
};

/// How long a placed call waits for the far end's answer bundle.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);
/// Recovery window before Disconnected/Failed becomes a closed call.
const DISCONNECT_GRACE: Duration = Duration::from_secs(10);
/// Upper bound on ICE gathering per negotiation.
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

const INCOMING_BUFFER: usize = 8;
const CALL_EVENT_BUFFER: usize = 8;

static DEFAULT_STUN_SERVERS: Lazy<Vec<RTCIceServer>> = Lazy::new(|| {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".into(),
            "stun:stun1.l.google.com:19302".into(),
        ],
        ..Default::default()
    }]
});

/// [`SignalingBackend`] over webrtc-rs and a pluggable signal channel.
pub struct RtcSignalingBackend {
    channel: Arc<dyn SignalChannel>,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcSignalingBackend {
    pub fn new(channel: Arc<dyn SignalChannel>) -> Self {
        RtcSignalingBackend {
            channel,
            ice_servers: DEFAULT_STUN_SERVERS.clone(),
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<RTCIceServer>) -> Self {
        if servers.is_empty() {
            tracing::warn!("empty ICE server list; keeping defaults");
        } else {
            self.ice_servers = servers;
        }
        self
    }
}

#[async_trait]
impl SignalingBackend for RtcSignalingBackend {
    async fn register(
        &self,
        address: &str,
    ) -> Result<Box<dyn SignalingConnection>, RegistrationError> {
        let inbox = self.channel.open(address).await?;
        let shared = Arc::new(ConnShared {
            address: address.to_string(),
            channel: self.channel.clone(),
            ice_servers: self.ice_servers.clone(),
            calls: Mutex::new(HashMap::new()),
        });

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        let router = tokio::spawn(route_envelopes(shared.clone(), inbox, incoming_tx));

        Ok(Box::new(RtcConnection {
            shared,
            incoming: Some(incoming_rx),
            router: Some(router),
        }))
    }
}

struct ConnShared {
    address: String,
    channel: Arc<dyn SignalChannel>,
    ice_servers: Vec<RTCIceServer>,
    calls: Mutex<HashMap<String, CallSlot>>,
}

enum CallSlot {
    /// Outbound call waiting for its answer bundle.
    AwaitingAnswer(oneshot::Sender<ConnectionBundle>),
    /// Negotiated call, kept addressable for `Bye` routing and teardown.
    Live(Arc<CallCtl>),
}

/// Per-call mutable state shared between the peer-connection callbacks,
/// the envelope router, and the handle.
struct CallCtl {
    call_id: String,
    peer: String,
    pc: Arc<RTCPeerConnection>,
    events_tx: mpsc::Sender<CallEvent>,
    remote_tracks: Mutex<Vec<RemoteTrack>>,
    closed: AtomicBool,
    grace: Mutex<Option<JoinHandle<()>>>,
}

impl CallCtl {
    /// Emit a terminal event once and close the transport. Later calls
    /// are no-ops, so remote `Bye`, state callbacks, and local teardown
    /// can all race safely.
    async fn finish(&self, event: CallEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(grace) = self.grace.lock().expect("grace lock").take() {
            grace.abort();
        }
        let _ = self.events_tx.send(event).await;
        let _ = self.pc.close().await;
    }

    /// Close without emitting an event (locally initiated teardown: the
    /// registry already dropped the session).
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(grace) = self.grace.lock().expect("grace lock").take() {
            grace.abort();
        }
        let _ = self.pc.close().await;
    }
}

struct RtcConnection {
    shared: Arc<ConnShared>,
    incoming: Option<mpsc::Receiver<Box<dyn PendingCall>>>,
    router: Option<JoinHandle<()>>,
}

#[async_trait]
impl SignalingConnection for RtcConnection {
    fn take_incoming(&mut self) -> Option<mpsc::Receiver<Box<dyn PendingCall>>> {
        self.incoming.take()
    }

    async fn call(
        &self,
        address: &str,
        local: &LocalMediaHandle,
    ) -> Result<Box<dyn CallHandle>, CallError> {
        let call_id = random_call_id();
        let (ctl, events_rx) = build_call(&self.shared, address, &call_id, local).await?;
        let candidates = collect_candidates(&ctl.pc, &call_id);

        let offer = ctl
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::negotiation(address, e))?;
        ctl.pc
            .set_local_description(offer)
            .await
            .map_err(|e| CallError::negotiation(address, e))?;
        wait_gathering(&ctl.pc, address).await;
        let sdp = ctl.pc.local_description().await.ok_or_else(|| {
            CallError::negotiation(address, "no local description after gathering")
        })?;

        let bundle = ConnectionBundle {
            sdp_payload: SdpPayload {
                sdp,
                call_id: call_id.clone(),
                ts: chrono::Utc::now().timestamp(),
            },
            ice_candidates: candidates.lock().expect("candidate lock").clone(),
        };

        // The waiter must be in place before the offer leaves, so a fast
        // answer cannot arrive unmatched.
        let (answer_tx, answer_rx) = oneshot::channel();
        self.shared
            .calls
            .lock()
            .expect("calls lock")
            .insert(call_id.clone(), CallSlot::AwaitingAnswer(answer_tx));

        let envelope = SignalEnvelope {
            from: self.shared.address.clone(),
            to: address.to_string(),
            message: SignalMessage::Offer {
                bundle: encode_bundle(&bundle)?,
            },
        };
        if let Err(err) = self.shared.channel.send(envelope).await {
            abandon(&self.shared, &ctl).await;
            return Err(err);
        }

        let answer = match timeout(ANSWER_TIMEOUT, answer_rx).await {
            Ok(Ok(bundle)) => bundle,
            Ok(Err(_)) => {
                abandon(&self.shared, &ctl).await;
                return Err(CallError::negotiation(address, "call cancelled before answer"));
            }
            Err(_) => {
                abandon(&self.shared, &ctl).await;
                return Err(CallError::negotiation(address, "timed out waiting for answer"));
            }
        };

        if let Err(err) = ctl.pc.set_remote_description(answer.sdp_payload.sdp).await {
            abandon(&self.shared, &ctl).await;
            return Err(CallError::negotiation(address, err));
        }
        apply_candidates(&ctl.pc, &answer.ice_candidates).await;

        self.shared
            .calls
            .lock()
            .expect("calls lock")
            .insert(call_id, CallSlot::Live(ctl.clone()));

        Ok(Box::new(RtcCallHandle {
            ctl,
            shared: self.shared.clone(),
            direction: CallDirection::Outbound,
            events: Some(events_rx),
        }))
    }

    async fn destroy(&mut self) {
        self.incoming = None;
        if let Some(router) = self.router.take() {
            router.abort();
        }

        // Anything still in the map was not closed through the registry;
        // close it here rather than leak the peer connection.
        let leftovers: Vec<Arc<CallCtl>> = {
            let mut calls = self.shared.calls.lock().expect("calls lock");
            calls
                .drain()
                .filter_map(|(_, slot)| match slot {
                    CallSlot::Live(ctl) => Some(ctl),
                    CallSlot::AwaitingAnswer(_) => None,
                })
                .collect()
        };
        for ctl in leftovers {
            ctl.shutdown().await;
        }

        self.shared.channel.close(&self.shared.address).await;
    }
}

/// A decoded offer waiting for the session manager to answer it.
struct RtcPendingCall {
    caller: String,
    bundle: ConnectionBundle,
    shared: Arc<ConnShared>,
}

#[async_trait]
impl PendingCall for RtcPendingCall {
    fn caller(&self) -> &str {
        &self.caller
    }

    async fn answer(
        self: Box<Self>,
        local: &LocalMediaHandle,
    ) -> Result<Box<dyn CallHandle>, CallError> {
        let RtcPendingCall {
            caller,
            bundle,
            shared,
        } = *self;
        let call_id = bundle.sdp_payload.call_id.clone();

        let (ctl, events_rx) = build_call(&shared, &caller, &call_id, local).await?;
        let candidates = collect_candidates(&ctl.pc, &call_id);

        if let Err(err) = ctl.pc.set_remote_description(bundle.sdp_payload.sdp).await {
            abandon(&shared, &ctl).await;
            return Err(CallError::negotiation(caller.as_str(), err));
        }
        apply_candidates(&ctl.pc, &bundle.ice_candidates).await;

        let answer = match ctl.pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                abandon(&shared, &ctl).await;
                return Err(CallError::negotiation(caller.as_str(), err));
            }
        };
        if let Err(err) = ctl.pc.set_local_description(answer).await {
            abandon(&shared, &ctl).await;
            return Err(CallError::negotiation(caller.as_str(), err));
        }
        wait_gathering(&ctl.pc, &caller).await;
        let sdp = match ctl.pc.local_description().await {
            Some(sdp) => sdp,
            None => {
                abandon(&shared, &ctl).await;
                return Err(CallError::negotiation(
                    caller.as_str(),
                    "no local description after gathering",
                ));
            }
        };

        let answer_bundle = ConnectionBundle {
            sdp_payload: SdpPayload {
                sdp,
                call_id: call_id.clone(),
                ts: chrono::Utc::now().timestamp(),
            },
            ice_candidates: candidates.lock().expect("candidate lock").clone(),
        };
        let envelope = SignalEnvelope {
            from: shared.address.clone(),
            to: caller.clone(),
            message: SignalMessage::Answer {
                bundle: encode_bundle(&answer_bundle)?,
            },
        };
        if let Err(err) = shared.channel.send(envelope).await {
            abandon(&shared, &ctl).await;
            return Err(err);
        }

        shared
            .calls
            .lock()
            .expect("calls lock")
            .insert(call_id, CallSlot::Live(ctl.clone()));

        Ok(Box::new(RtcCallHandle {
            ctl,
            shared,
            direction: CallDirection::Inbound,
            events: Some(events_rx),
        }))
    }
}

struct RtcCallHandle {
    ctl: Arc<CallCtl>,
    shared: Arc<ConnShared>,
    direction: CallDirection,
    events: Option<mpsc::Receiver<CallEvent>>,
}

impl CallHandle for RtcCallHandle {
    fn remote_address(&self) -> &str {
        &self.ctl.peer
    }

    fn direction(&self) -> CallDirection {
        self.direction
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<CallEvent>> {
        self.events.take()
    }

    fn close(&self) {
        let ctl = self.ctl.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared
                .calls
                .lock()
                .expect("calls lock")
                .remove(&ctl.call_id);
            if !ctl.closed.load(Ordering::SeqCst) {
                let bye = SignalEnvelope {
                    from: shared.address.clone(),
                    to: ctl.peer.clone(),
                    message: SignalMessage::Bye {
                        call_id: ctl.call_id.clone(),
                    },
                };
                if let Err(err) = shared.channel.send(bye).await {
                    tracing::debug!(peer = %ctl.peer, %err, "bye not delivered");
                }
            }
            ctl.shutdown().await;
        });
    }
}

/// Dispatch inbound envelopes: offers become pending calls, answers wake
/// their waiting `call()`, byes finish live calls.
async fn route_envelopes(
    shared: Arc<ConnShared>,
    mut inbox: mpsc::Receiver<SignalEnvelope>,
    incoming_tx: mpsc::Sender<Box<dyn PendingCall>>,
) {
    while let Some(envelope) = inbox.recv().await {
        match envelope.message {
            SignalMessage::Offer { bundle } => match decode_bundle(&bundle) {
                Ok(bundle) => {
                    let pending = RtcPendingCall {
                        caller: envelope.from,
                        bundle,
                        shared: shared.clone(),
                    };
                    if incoming_tx.send(Box::new(pending)).await.is_err() {
                        tracing::debug!("incoming-call consumer gone; dropping offer");
                    }
                }
                Err(err) => {
                    tracing::warn!(from = %envelope.from, %err, "undecodable offer ignored")
                }
            },
            SignalMessage::Answer { bundle } => match decode_bundle(&bundle) {
                Ok(bundle) => {
                    let call_id = bundle.sdp_payload.call_id.clone();
                    let waiter = {
                        let mut calls = shared.calls.lock().expect("calls lock");
                        match calls.remove(&call_id) {
                            Some(CallSlot::AwaitingAnswer(tx)) => Some(tx),
                            Some(live) => {
                                calls.insert(call_id.clone(), live);
                                None
                            }
                            None => None,
                        }
                    };
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(bundle);
                        }
                        None => {
                            tracing::debug!(%call_id, from = %envelope.from, "unmatched answer")
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(from = %envelope.from, %err, "undecodable answer ignored")
                }
            },
            SignalMessage::Bye { call_id } => {
                let slot = shared.calls.lock().expect("calls lock").remove(&call_id);
                match slot {
                    Some(CallSlot::Live(ctl)) => ctl.finish(CallEvent::Closed).await,
                    // Dropping the waiter cancels the pending `call()`.
                    Some(CallSlot::AwaitingAnswer(_)) | None => {}
                }
            }
        }
    }
}

/// Create the peer connection for one call, publish the local tracks, and
/// wire lifecycle callbacks.
async fn build_call(
    shared: &ConnShared,
    peer: &str,
    call_id: &str,
    local: &LocalMediaHandle,
) -> Result<(Arc<CallCtl>, mpsc::Receiver<CallEvent>), CallError> {
    let api = build_api().map_err(|e| CallError::negotiation(peer, e))?;
    let pc = Arc::new(
        api.new_peer_connection(rtc_config(shared.ice_servers.clone()))
            .await
            .map_err(|e| CallError::negotiation(peer, e))?,
    );

    for track in local.tracks() {
        if let TrackSource::Rtc(rtc_track) = track.source() {
            pc.add_track(Arc::clone(rtc_track))
                .await
                .map_err(|e| CallError::negotiation(peer, e))?;
        }
    }

    let (events_tx, events_rx) = mpsc::channel(CALL_EVENT_BUFFER);
    let ctl = Arc::new(CallCtl {
        call_id: call_id.to_string(),
        peer: peer.to_string(),
        pc,
        events_tx,
        remote_tracks: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
        grace: Mutex::new(None),
    });
    attach_handlers(&ctl);
    Ok((ctl, events_rx))
}

fn attach_handlers(ctl: &Arc<CallCtl>) {
    let on_track_ctl = ctl.clone();
    ctl.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let ctl = on_track_ctl.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return,
            };
            tracing::debug!(peer = %ctl.peer, %kind, "remote track arrived");
            let handle = {
                let mut tracks = ctl.remote_tracks.lock().expect("remote tracks lock");
                tracks.push(RemoteTrack {
                    kind,
                    source: RemoteTrackSource::Rtc(track),
                });
                RemoteMediaHandle::new(ctl.peer.clone(), tracks.clone())
            };
            let _ = ctl.events_tx.send(CallEvent::Stream(handle)).await;
        })
    }));

    let state_ctl = ctl.clone();
    ctl.pc
        .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let ctl = state_ctl.clone();
            Box::pin(async move {
                tracing::debug!(peer = %ctl.peer, ?state, "peer connection state");
                match state {
                    RTCPeerConnectionState::Connected => {
                        // Recovered inside the grace period.
                        if let Some(grace) = ctl.grace.lock().expect("grace lock").take() {
                            grace.abort();
                        }
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        let mut grace = ctl.grace.lock().expect("grace lock");
                        if grace.is_some() {
                            return;
                        }
                        let watch = ctl.clone();
                        *grace = Some(tokio::spawn(async move {
                            sleep(DISCONNECT_GRACE).await;
                            if watch.pc.connection_state() != RTCPeerConnectionState::Connected {
                                watch
                                    .finish(CallEvent::Failed(
                                        "connection did not recover within grace period".into(),
                                    ))
                                    .await;
                            }
                        }));
                    }
                    RTCPeerConnectionState::Closed => {
                        ctl.finish(CallEvent::Closed).await;
                    }
                    _ => {}
                }
            })
        }));
}

/// Collect local candidates for the bundle as they trickle in.
fn collect_candidates(
    pc: &Arc<RTCPeerConnection>,
    call_id: &str,
) -> Arc<Mutex<Vec<IceCandidate>>> {
    let store = Arc::new(Mutex::new(Vec::new()));
    let sink = store.clone();
    let call_id = call_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        let call_id = call_id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                // End of gathering.
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.lock().expect("candidate lock").push(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    call_id,
                }),
                Err(err) => tracing::warn!(%err, "local candidate not serializable"),
            }
        })
    }));
    store
}

async fn wait_gathering(pc: &Arc<RTCPeerConnection>, peer: &str) {
    let mut done = pc.gathering_complete_promise().await;
    if timeout(GATHER_TIMEOUT, done.recv()).await.is_err() {
        tracing::warn!(peer, "ICE gathering incomplete; bundling what we have");
    }
}

async fn apply_candidates(pc: &Arc<RTCPeerConnection>, candidates: &[IceCandidate]) {
    for candidate in candidates {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        if let Err(err) = pc.add_ice_candidate(init).await {
            tracing::warn!(%err, "remote candidate rejected");
        }
    }
}

/// Drop a half-built call without emitting events.
async fn abandon(shared: &ConnShared, ctl: &CallCtl) {
    shared
        .calls
        .lock()
        .expect("calls lock")
        .remove(&ctl.call_id);
    ctl.shutdown().await;
}

fn build_api() -> Result<API, webrtc::Error> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_config(ice_servers: Vec<RTCIceServer>) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn random_call_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}
