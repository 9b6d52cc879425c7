use std::collections::HashMap;
use std::sync::Arc;

use crate::media::{RemoteMediaHandle, TrackKind};
use crate::peer::session::{PeerSession, SessionPhase};
use crate::render::{InteractionBus, RenderBinding, SinkFactory, SinkKind, SinkSource};

/// The mesh coordinator: at most one live session per remote address, and
/// the single authority over peer lifecycle. All mutation happens through
/// the session actor; observers only ever see derived snapshots.
pub struct PeerSessionRegistry {
    sessions: HashMap<String, PeerSession>,
    sinks: Arc<dyn SinkFactory>,
    interactions: Arc<InteractionBus>,
    volume: f32,
}

impl PeerSessionRegistry {
    pub fn new(
        sinks: Arc<dyn SinkFactory>,
        interactions: Arc<InteractionBus>,
        volume: f32,
    ) -> Self {
        PeerSessionRegistry {
            sessions: HashMap::new(),
            sinks,
            interactions,
            volume: volume.clamp(0.0, 1.0),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.sessions.contains_key(address)
    }

    /// Install a freshly negotiated session. A duplicate address replaces
    /// the prior session (last writer wins): the stale one is closed here,
    /// before the new one becomes visible, so address reuse can never leak
    /// a half-open call. Returns whether a prior session was displaced.
    pub fn install(&mut self, session: PeerSession) -> bool {
        let address = session.address().to_string();
        match self.sessions.insert(address.clone(), session) {
            Some(stale) => {
                tracing::debug!(peer = %address, "duplicate offer; closing stale session");
                stale.close();
                true
            }
            None => false,
        }
    }

    /// Attach the far end's stream, creating render bindings for media
    /// kinds that have none yet. Returns `true` on the
    /// `Negotiating -> Active` transition; a stream for an unknown address
    /// (e.g. one that raced with teardown) is ignored.
    pub fn attach_stream(&mut self, address: &str, remote: RemoteMediaHandle) -> bool {
        let Some(session) = self.sessions.get_mut(address) else {
            tracing::debug!(peer = %address, "stream for unknown session ignored");
            return false;
        };

        let mut bindings = Vec::new();
        for (track_kind, sink_kind) in [
            (TrackKind::Audio, SinkKind::RemoteAudio),
            (TrackKind::Video, SinkKind::RemoteVideo),
        ] {
            if remote.has_kind(track_kind) && !session.has_binding(sink_kind) {
                let sink = self.sinks.create(sink_kind, address);
                let binding = RenderBinding::bind(
                    sink_kind,
                    address,
                    sink,
                    SinkSource::Remote(remote.clone()),
                    self.interactions.clone(),
                );
                binding.set_volume(self.volume);
                bindings.push(binding);
            }
        }

        let was_active = session.is_active();
        session.attach(remote, bindings);
        !was_active
    }

    /// Drop and close one session. `None` means the address was not
    /// registered, the no-op case for close events arriving after
    /// teardown already removed the session.
    pub fn remove(&mut self, address: &str) -> Option<SessionPhase> {
        let session = self.sessions.remove(address)?;
        let phase = session.phase();
        session.close();
        Some(phase)
    }

    /// Close every session and clear the set. Closing a call whose
    /// transport already went away is the transport's tolerated no-op, so
    /// repeated teardown is safe.
    pub fn close_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close();
        }
    }

    /// Derived roster: the local participant plus every active remote
    /// address, in stable order.
    pub fn roster(&self, self_address: &str) -> Vec<String> {
        let mut remotes: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.address().to_string())
            .collect();
        remotes.sort();

        let mut roster = Vec::with_capacity(remotes.len() + 1);
        roster.push(self_address.to_string());
        roster.extend(remotes);
        roster
    }

    /// Apply a playout volume to every bound remote-audio sink, and to
    /// sinks bound from here on.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        for session in self.sessions.values() {
            for binding in session.bindings() {
                binding.set_volume(self.volume);
            }
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }
}
