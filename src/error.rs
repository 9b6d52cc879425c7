use thiserror::Error;

/// Failure to open a capture device. Fatal for the current connect
/// attempt; never retried automatically (a retry needs a fresh user
/// gesture in most runtimes).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,
    #[error("no capture device matches the request")]
    NotFound,
    #[error("capture device is in use by another application")]
    Busy,
}

/// Failure to register an address with the signaling service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("signaling service unreachable: {0}")]
    Unreachable(String),
    #[error("signaling service rejected address {0:?}")]
    Rejected(String),
}

/// Per-peer call failure. Non-fatal to the overall session: the affected
/// peer session is dropped, the rest continue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },
    #[error("malformed signal payload: {0}")]
    BadSignal(String),
    #[error("signaling connection closed")]
    ConnectionClosed,
}

impl CallError {
    pub(crate) fn negotiation(peer: impl Into<String>, reason: impl ToString) -> Self {
        CallError::Negotiation {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}

/// Sink playback failure. `Rejected` is the recoverable autoplay case.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("playback rejected by the runtime; a user gesture is required")]
    Rejected,
    #[error("sink failed: {0}")]
    Sink(String),
}

/// Errors surfaced by the public session API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("no local media handle is live; connect first")]
    NoLocalMedia,
    #[error("a session is already connected")]
    AlreadyConnected,
    #[error("session task is gone")]
    Closed,
}
