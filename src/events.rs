//! Observable session state: a `watch`-able snapshot plus discrete
//! transition events, emitted by the session actor on every change.

use tokio::sync::{broadcast, watch};

use crate::media::CaptureQuality;

/// Discrete transitions, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { address: String },
    Disconnected,
    PeerJoined { address: String },
    PeerLeft { address: String },
    MuteChanged { muted: bool },
    VideoChanged { enabled: bool },
}

/// Level-style view of the session, always internally consistent: the
/// participant list and the flags are updated in the same emission as the
/// registry change that caused them.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub muted: bool,
    pub video_enabled: bool,
    /// Remote audio playout volume, `0.0..=1.0`.
    pub volume: f32,
    pub capture_quality: Option<CaptureQuality>,
    /// Local participant first, then active remote addresses.
    pub participants: Vec<String>,
}

impl SessionSnapshot {
    pub(crate) fn disconnected(muted: bool, volume: f32) -> Self {
        SessionSnapshot {
            connected: false,
            muted,
            video_enabled: false,
            volume,
            capture_quality: None,
            participants: Vec::new(),
        }
    }
}

const EVENT_BUFFER: usize = 64;

pub(crate) struct StateEmitter {
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl StateEmitter {
    pub(crate) fn new(
        initial: SessionSnapshot,
    ) -> (Self, watch::Receiver<SessionSnapshot>, broadcast::Sender<SessionEvent>) {
        let (snapshot, snapshot_rx) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        (
            StateEmitter {
                snapshot,
                events: events.clone(),
            },
            snapshot_rx,
            events,
        )
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        tracing::debug!(?event, "session event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn update(&self, mutate: impl FnOnce(&mut SessionSnapshot)) {
        self.snapshot.send_modify(mutate);
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }
}
