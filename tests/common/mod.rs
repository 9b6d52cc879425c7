//! Scriptable fake capabilities for driving a `CallSession` end to end:
//! a device backend that counts live hardware tracks, a signaling backend
//! the test can feed offers and call events through, and a sink factory
//! that records playback wiring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use callmesh::media::{
    LocalMediaHandle, MediaDevices, MediaTrack, RemoteMediaHandle, RemoteTrack, RemoteTrackSource,
    TrackSource,
};
use callmesh::signaling::{
    CallDirection, CallEvent, CallHandle, PendingCall, SignalingBackend, SignalingConnection,
};
use callmesh::{
    Capabilities, CallSession, DeviceError, MediaConstraints, MediaSink, PlaybackError,
    RegistrationError, Resolution, SessionConfig, SinkFactory, SinkKind, SinkSource, TrackKind,
};

pub const WAIT: Duration = Duration::from_secs(2);

/// Poll until `probe` holds or the deadline passes.
pub async fn wait_until(probe: impl Fn() -> bool) {
    let ok = tokio::time::timeout(WAIT, async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "condition not reached within {WAIT:?}");
}

#[derive(Default)]
pub struct FakeDevices {
    pub live_tracks: Arc<AtomicUsize>,
    pub requests: AtomicUsize,
    pub fail_with: Mutex<Option<DeviceError>>,
    pub created: Mutex<Vec<Arc<MediaTrack>>>,
}

impl FakeDevices {
    fn make_track(&self, kind: TrackKind, label: &str) -> Arc<MediaTrack> {
        self.live_tracks.fetch_add(1, Ordering::SeqCst);
        let live = self.live_tracks.clone();
        let mut track = MediaTrack::new(kind, label, TrackSource::Null).with_stop_hook(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        });
        if kind == TrackKind::Video {
            track = track.with_granted_resolution(Resolution::new(1280, 720));
        }
        let track = Arc::new(track);
        self.created.lock().unwrap().push(track.clone());
        track
    }

    pub fn live(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    pub fn audio_enabled_flags(&self) -> Vec<bool> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.kind() == TrackKind::Audio)
            .map(|t| t.is_enabled())
            .collect()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn request_user_media(
        &self,
        _constraints: &MediaConstraints,
        video: bool,
    ) -> Result<Vec<Arc<MediaTrack>>, DeviceError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = *self.fail_with.lock().unwrap() {
            return Err(err);
        }
        let mut tracks = vec![self.make_track(TrackKind::Audio, "fake-mic")];
        if video {
            tracks.push(self.make_track(TrackKind::Video, "fake-cam"));
        }
        Ok(tracks)
    }
}

/// Shared scripting surface for the fake signaling service.
#[derive(Default)]
pub struct SignalHarness {
    pub registered: Mutex<Vec<String>>,
    pub register_failures: Mutex<usize>,
    pub destroyed: AtomicUsize,
    incoming: Mutex<Option<mpsc::Sender<Box<dyn PendingCall>>>>,
    call_events: Mutex<HashMap<String, mpsc::Sender<CallEvent>>>,
    pub closed_calls: Mutex<Vec<String>>,
}

impl SignalHarness {
    pub fn registered_addresses(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn fail_next_registration(&self) {
        *self.register_failures.lock().unwrap() += 1;
    }

    pub fn has_call(&self, peer: &str) -> bool {
        self.call_events.lock().unwrap().contains_key(peer)
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed_calls.lock().unwrap().clone()
    }

    /// Deliver an inbound offer from `caller`.
    pub async fn offer(self: &Arc<Self>, caller: &str) {
        let sender = self
            .incoming
            .lock()
            .unwrap()
            .clone()
            .expect("no live registration");
        let pending = FakePendingCall {
            caller: caller.to_string(),
            harness: self.clone(),
        };
        sender.send(Box::new(pending)).await.expect("offer queue");
    }

    /// Deliver the far end's stream for an answered/placed call.
    pub async fn send_stream(&self, peer: &str, kinds: &[TrackKind]) {
        let tracks = kinds
            .iter()
            .map(|&kind| RemoteTrack {
                kind,
                source: RemoteTrackSource::Null,
            })
            .collect();
        let handle = RemoteMediaHandle::new(peer, tracks);
        self.send_event(peer, CallEvent::Stream(handle)).await;
    }

    /// Close an established call from the transport side.
    pub async fn close_call(&self, peer: &str) {
        self.send_event(peer, CallEvent::Closed).await;
    }

    async fn send_event(&self, peer: &str, event: CallEvent) {
        let sender = self
            .call_events
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .expect("no such call");
        sender.send(event).await.expect("call event queue");
    }

    fn new_call(self: &Arc<Self>, peer: &str, direction: CallDirection) -> FakeCallHandle {
        let (tx, rx) = mpsc::channel(8);
        self.call_events
            .lock()
            .unwrap()
            .insert(peer.to_string(), tx);
        FakeCallHandle {
            peer: peer.to_string(),
            direction,
            events: Some(rx),
            harness: self.clone(),
        }
    }
}

pub struct FakeSignaling {
    pub harness: Arc<SignalHarness>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        FakeSignaling {
            harness: Arc::new(SignalHarness::default()),
        }
    }
}

#[async_trait]
impl SignalingBackend for FakeSignaling {
    async fn register(
        &self,
        address: &str,
    ) -> Result<Box<dyn SignalingConnection>, RegistrationError> {
        {
            let mut failures = self.harness.register_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RegistrationError::Unreachable("scripted failure".into()));
            }
        }
        self.harness
            .registered
            .lock()
            .unwrap()
            .push(address.to_string());
        let (tx, rx) = mpsc::channel(8);
        *self.harness.incoming.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeConnection {
            harness: self.harness.clone(),
            incoming: Some(rx),
        }))
    }
}

struct FakeConnection {
    harness: Arc<SignalHarness>,
    incoming: Option<mpsc::Receiver<Box<dyn PendingCall>>>,
}

#[async_trait]
impl SignalingConnection for FakeConnection {
    fn take_incoming(&mut self) -> Option<mpsc::Receiver<Box<dyn PendingCall>>> {
        self.incoming.take()
    }

    async fn call(
        &self,
        address: &str,
        _local: &LocalMediaHandle,
    ) -> Result<Box<dyn CallHandle>, callmesh::CallError> {
        Ok(Box::new(self.harness.new_call(address, CallDirection::Outbound)))
    }

    async fn destroy(&mut self) {
        self.harness.destroyed.fetch_add(1, Ordering::SeqCst);
        *self.harness.incoming.lock().unwrap() = None;
    }
}

struct FakePendingCall {
    caller: String,
    harness: Arc<SignalHarness>,
}

#[async_trait]
impl PendingCall for FakePendingCall {
    fn caller(&self) -> &str {
        &self.caller
    }

    async fn answer(
        self: Box<Self>,
        _local: &LocalMediaHandle,
    ) -> Result<Box<dyn CallHandle>, callmesh::CallError> {
        Ok(Box::new(
            self.harness.new_call(&self.caller, CallDirection::Inbound),
        ))
    }
}

struct FakeCallHandle {
    peer: String,
    direction: CallDirection,
    events: Option<mpsc::Receiver<CallEvent>>,
    harness: Arc<SignalHarness>,
}

impl CallHandle for FakeCallHandle {
    fn remote_address(&self) -> &str {
        &self.peer
    }

    fn direction(&self) -> CallDirection {
        self.direction
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<CallEvent>> {
        self.events.take()
    }

    fn close(&self) {
        self.harness
            .closed_calls
            .lock()
            .unwrap()
            .push(self.peer.clone());
    }
}

#[derive(Default)]
pub struct RecordingSinks {
    pub created: AtomicUsize,
    pub detached: Arc<AtomicUsize>,
}

struct OkSink {
    detached: Arc<AtomicUsize>,
}

impl MediaSink for OkSink {
    fn attach(&self, _source: &SinkSource) {}
    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
    fn play(&self) -> Result<(), PlaybackError> {
        Ok(())
    }
    fn set_muted(&self, _muted: bool) {}
    fn set_volume(&self, _volume: f32) {}
    fn set_mirrored(&self, _mirrored: bool) {}
}

impl SinkFactory for RecordingSinks {
    fn create(&self, _kind: SinkKind, _peer: &str) -> Arc<dyn MediaSink> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(OkSink {
            detached: self.detached.clone(),
        })
    }
}

/// A full test rig: session plus handles on every fake.
pub struct Rig {
    pub session: CallSession,
    pub devices: Arc<FakeDevices>,
    pub signals: Arc<SignalHarness>,
    pub sinks: Arc<RecordingSinks>,
}

pub fn rig() -> Rig {
    rig_with_config(SessionConfig::default())
}

pub fn rig_with_config(config: SessionConfig) -> Rig {
    let devices = Arc::new(FakeDevices::default());
    let signaling = FakeSignaling::new();
    let signals = signaling.harness.clone();
    let sinks = Arc::new(RecordingSinks::default());
    let session = CallSession::spawn(
        Capabilities {
            devices: devices.clone(),
            signaling: Arc::new(signaling),
            sinks: sinks.clone(),
        },
        config,
    );
    Rig {
        session,
        devices,
        signals,
        sinks,
    }
}
