use crate::media::RemoteMediaHandle;
use crate::render::{RenderBinding, SinkKind};
use crate::signaling::{CallDirection, CallHandle};

/// Where a session sits between offer and teardown. `Absent` and `Closed`
/// are not represented: a session outside the registry does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Call answered or placed; the far end's stream has not arrived yet.
    Negotiating,
    /// Remote stream attached and rendering.
    Active,
}

/// One remote participant's call, its stream, and its render bindings.
/// Owned exclusively by the [`PeerSessionRegistry`]; closing consumes the
/// session so nothing can hold it past teardown.
///
/// [`PeerSessionRegistry`]: crate::peer::PeerSessionRegistry
pub struct PeerSession {
    address: String,
    direction: CallDirection,
    phase: SessionPhase,
    call: Box<dyn CallHandle>,
    remote: Option<RemoteMediaHandle>,
    bindings: Vec<RenderBinding>,
}

impl PeerSession {
    pub fn negotiating(call: Box<dyn CallHandle>) -> Self {
        PeerSession {
            address: call.remote_address().to_string(),
            direction: call.direction(),
            phase: SessionPhase::Negotiating,
            call,
            remote: None,
            bindings: Vec::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    pub fn remote(&self) -> Option<&RemoteMediaHandle> {
        self.remote.as_ref()
    }

    pub(crate) fn has_binding(&self, kind: SinkKind) -> bool {
        self.bindings.iter().any(|b| b.sink_kind() == kind)
    }

    pub(crate) fn bindings(&self) -> &[RenderBinding] {
        &self.bindings
    }

    pub(crate) fn attach(&mut self, remote: RemoteMediaHandle, bindings: Vec<RenderBinding>) {
        self.remote = Some(remote);
        self.bindings.extend(bindings);
        self.phase = SessionPhase::Active;
    }

    /// Unbind every sink, then close the transport call.
    pub fn close(mut self) {
        for binding in self.bindings.drain(..) {
            binding.unbind();
        }
        self.call.close();
    }
}
