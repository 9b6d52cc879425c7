use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{MediaConstraints, Resolution};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Transport backing of a local track.
pub enum TrackSource {
    /// No transport backing (headless runs, tests).
    Null,
    /// A webrtc-rs local track, ready to be published on a peer connection.
    Rtc(Arc<dyn TrackLocal + Send + Sync>),
}

type StopHook = Box<dyn Fn() + Send + Sync>;

/// One captured device track. `enabled` is the mute/video-off flag and is
/// independent of `stop()`: a disabled track stays allocated, a stopped
/// track has released its hardware.
pub struct MediaTrack {
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    granted: Option<Resolution>,
    source: TrackSource,
    on_stop: Mutex<Option<StopHook>>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, source: TrackSource) -> Self {
        MediaTrack {
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            granted: None,
            source,
            on_stop: Mutex::new(None),
        }
    }

    /// Record the resolution the device actually granted (video tracks).
    pub fn with_granted_resolution(mut self, granted: Resolution) -> Self {
        self.granted = Some(granted);
        self
    }

    /// Run `hook` when the track is stopped; used by device backends to
    /// release the underlying hardware.
    pub fn with_stop_hook(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        *self.on_stop.lock().expect("stop hook lock") = Some(Box::new(hook));
        self
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn granted_resolution(&self) -> Option<Resolution> {
        self.granted
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    /// Stop the track and release its device. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = self.on_stop.lock().expect("stop hook lock").take() {
            hook();
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Rough capture quality derived from the granted video resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureQuality {
    Good,
    Degraded,
}

/// The local participant's captured stream. Exclusively owned by the
/// session manager; `release()` stops every hardware track and must run
/// before a new handle is acquired.
pub struct LocalMediaHandle {
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalMediaHandle {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        LocalMediaHandle { tracks }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    /// Flip the enabled flag on every track of `kind`. This is the whole
    /// of mute/video-toggle: no renegotiation, tracks stay allocated.
    pub fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn capture_quality(&self) -> Option<CaptureQuality> {
        let granted = self
            .tracks_of(TrackKind::Video)
            .find_map(|t| t.granted_resolution())?;
        if granted.width >= 1280 {
            Some(CaptureQuality::Good)
        } else {
            Some(CaptureQuality::Degraded)
        }
    }

    /// Stop every track. Idempotent; leaving a track unstopped keeps the
    /// camera/microphone indicator lit indefinitely.
    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("tracks", &self.tracks)
            .finish()
    }
}

/// Transport backing of a remote track.
#[derive(Clone)]
pub enum RemoteTrackSource {
    Null,
    Rtc(Arc<TrackRemote>),
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub source: RemoteTrackSource,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack").field("kind", &self.kind).finish()
    }
}

/// A remote participant's stream as delivered by the transport. Cheap to
/// clone; valid only while its peer session is alive.
#[derive(Clone, Debug)]
pub struct RemoteMediaHandle {
    peer: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteMediaHandle {
    pub fn new(peer: impl Into<String>, tracks: Vec<RemoteTrack>) -> Self {
        RemoteMediaHandle {
            peer: peer.into(),
            tracks,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Device capability: opens camera/microphone hardware.
///
/// Implementations must treat the ideal resolution/frame-rate constraints
/// as best-effort (failing a non-critical field falls back instead of
/// erroring) and must wire stop hooks so `MediaTrack::stop` actually
/// releases the device.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn request_user_media(
        &self,
        constraints: &MediaConstraints,
        video: bool,
    ) -> Result<Vec<Arc<MediaTrack>>, DeviceError>;
}

/// Acquire a local media handle. Audio is always requested; video only on
/// demand. Errors are surfaced as-is and never retried here.
pub async fn acquire(
    devices: &dyn MediaDevices,
    constraints: &MediaConstraints,
    video: bool,
) -> Result<LocalMediaHandle, DeviceError> {
    let tracks = devices.request_user_media(constraints, video).await?;
    let handle = LocalMediaHandle::new(tracks);
    tracing::debug!(
        tracks = handle.tracks().len(),
        video,
        quality = ?handle.capture_quality(),
        "acquired local media"
    );
    Ok(handle)
}
