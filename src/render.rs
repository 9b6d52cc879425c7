//! Presentation sinks: per-peer audio/video output adapters.
//!
//! A [`RenderBinding`] ties one remote (or local-preview) stream to one
//! sink for exactly the lifetime of its peer session. Autoplay rejection
//! is recovered by a one-shot retry on the next user interaction, routed
//! through the [`InteractionBus`] and cancelled if the binding is unbound
//! before the gesture arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::PlaybackError;
use crate::media::{MediaTrack, RemoteMediaHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    RemoteAudio,
    RemoteVideo,
    /// The local participant's own camera, mirrored and force-muted.
    LocalPreview,
}

/// What a binding feeds into a sink.
#[derive(Clone)]
pub enum SinkSource {
    Remote(RemoteMediaHandle),
    Local(Vec<Arc<MediaTrack>>),
}

/// Presentation capability: a playable output accepting a media handle.
pub trait MediaSink: Send + Sync {
    /// Point the sink at a stream. Called once per binding.
    fn attach(&self, source: &SinkSource);

    /// Drop the sink's reference to the stream. Required on every unbind:
    /// some runtimes keep decoder resources alive while a sink still
    /// references the stream, even after its tracks stopped.
    fn detach(&self);

    /// Start playback. [`PlaybackError::Rejected`] is the recoverable
    /// autoplay case.
    fn play(&self) -> Result<(), PlaybackError>;

    fn set_muted(&self, muted: bool);

    fn set_volume(&self, volume: f32);

    fn set_mirrored(&self, mirrored: bool);
}

/// Creates one sink per peer and media kind.
pub trait SinkFactory: Send + Sync {
    fn create(&self, kind: SinkKind, peer: &str) -> Arc<dyn MediaSink>;
}

type Deferred = Box<dyn FnOnce() + Send>;

/// Forwarding point for user gestures (clicks, key presses). Blocked
/// playback registers a one-shot action here; the embedding UI calls
/// [`InteractionBus::notify`] on its next user interaction.
#[derive(Default)]
pub struct InteractionBus {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Deferred>>,
}

impl InteractionBus {
    pub fn new() -> Self {
        InteractionBus::default()
    }

    /// Run every deferred action exactly once.
    pub fn notify(&self) {
        let actions: Vec<Deferred> = {
            let mut pending = self.pending.lock().expect("interaction bus lock");
            pending.drain().map(|(_, action)| action).collect()
        };
        for action in actions {
            action();
        }
    }

    /// Number of actions still waiting for a gesture.
    pub fn pending_retries(&self) -> usize {
        self.pending.lock().expect("interaction bus lock").len()
    }

    fn defer(&self, action: Deferred) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .expect("interaction bus lock")
            .insert(id, action);
        id
    }

    fn cancel(&self, id: u64) {
        self.pending.lock().expect("interaction bus lock").remove(&id);
    }
}

/// One sink bound to one stream. Valid only while its peer session is
/// alive; unbound exactly once (explicitly or on drop).
pub struct RenderBinding {
    kind: SinkKind,
    peer: String,
    sink: Arc<dyn MediaSink>,
    interactions: Arc<InteractionBus>,
    retry: Option<u64>,
    released: bool,
}

impl RenderBinding {
    pub fn bind(
        kind: SinkKind,
        peer: &str,
        sink: Arc<dyn MediaSink>,
        source: SinkSource,
        interactions: Arc<InteractionBus>,
    ) -> Self {
        if kind == SinkKind::LocalPreview {
            // Never let the preview feed audio back into the room, and
            // mirror it the way users expect to see themselves.
            sink.set_muted(true);
            sink.set_mirrored(true);
        }
        sink.attach(&source);

        let retry = match sink.play() {
            Ok(()) => None,
            Err(PlaybackError::Rejected) => {
                tracing::debug!(peer, ?kind, "playback blocked; retrying on next user gesture");
                let retry_sink = sink.clone();
                let retry_peer = peer.to_string();
                Some(interactions.defer(Box::new(move || {
                    if let Err(err) = retry_sink.play() {
                        // Non-critical: silent output beats blocking the UI.
                        tracing::warn!(peer = %retry_peer, %err, "playback retry failed");
                    }
                })))
            }
            Err(err) => {
                tracing::warn!(peer, ?kind, %err, "sink playback failed");
                None
            }
        };

        RenderBinding {
            kind,
            peer: peer.to_string(),
            sink,
            interactions,
            retry,
            released: false,
        }
    }

    pub fn sink_kind(&self) -> SinkKind {
        self.kind
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        if self.kind == SinkKind::RemoteAudio {
            self.sink.set_volume(volume);
        }
    }

    /// Detach the sink and cancel any pending gesture retry.
    pub fn unbind(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(id) = self.retry.take() {
            self.interactions.cancel(id);
        }
        self.sink.detach();
    }
}

impl Drop for RenderBinding {
    fn drop(&mut self) {
        self.release();
    }
}
