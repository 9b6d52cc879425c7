//! Capability seam for the signaling service: register an address, receive
//! inbound call offers, place outbound calls, observe call lifecycles.
//!
//! The wire protocol behind these traits is not this crate's concern; the
//! provided webrtc-rs implementation lives in [`crate::transport`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CallError, RegistrationError};
use crate::media::{LocalMediaHandle, RemoteMediaHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// We answered the far end's offer.
    Inbound,
    /// We placed the call.
    Outbound,
}

/// Lifecycle notifications for one call.
pub enum CallEvent {
    /// The far end's stream arrived (or grew by a track).
    Stream(RemoteMediaHandle),
    /// The call closed normally.
    Closed,
    /// The call failed; treated like `Closed` after logging.
    Failed(String),
}

impl std::fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallEvent::Stream(handle) => write!(f, "Stream({})", handle.peer()),
            CallEvent::Closed => write!(f, "Closed"),
            CallEvent::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Entry point: one registration per connect attempt.
#[async_trait]
pub trait SignalingBackend: Send + Sync {
    async fn register(
        &self,
        address: &str,
    ) -> Result<Box<dyn SignalingConnection>, RegistrationError>;
}

/// A live registration. Destroyed exactly once, after every call has been
/// closed (teardown order is the caller's contract).
#[async_trait]
pub trait SignalingConnection: Send + Sync {
    /// Inbound call offers. Yields each offer exactly once; the stream may
    /// be taken once per registration lifetime.
    fn take_incoming(&mut self) -> Option<mpsc::Receiver<Box<dyn PendingCall>>>;

    /// Place an outbound call, offering `local`.
    async fn call(
        &self,
        address: &str,
        local: &LocalMediaHandle,
    ) -> Result<Box<dyn CallHandle>, CallError>;

    /// Withdraw the registration. Idempotent; pending offers are dropped.
    async fn destroy(&mut self);
}

/// An inbound offer that has not been answered yet.
#[async_trait]
pub trait PendingCall: Send + Sync {
    fn caller(&self) -> &str;

    /// Answer with `local`, producing a live call.
    async fn answer(
        self: Box<Self>,
        local: &LocalMediaHandle,
    ) -> Result<Box<dyn CallHandle>, CallError>;
}

/// One negotiated (or negotiating) call with a single remote participant.
pub trait CallHandle: Send + Sync {
    fn remote_address(&self) -> &str;

    fn direction(&self) -> CallDirection;

    /// Lifecycle events; the stream may be taken once, right after the
    /// handle is created.
    fn take_events(&mut self) -> Option<mpsc::Receiver<CallEvent>>;

    /// Ask the transport to close. Must tolerate repeated calls and calls
    /// after the far end already hung up.
    fn close(&self);
}
