//! Peer-to-peer audio/video session management for mesh chat rooms.
//!
//! One [`CallSession`] owns the whole media lifecycle: it acquires the
//! local camera/microphone, registers a fresh signaling address, answers
//! and places calls (one peer session per remote address), keeps the
//! observable mute/video/roster state in step with the transport, and
//! tears everything down without leaking a single hardware track.
//!
//! Device capture, the signaling service, and playout sinks are external
//! capabilities behind traits ([`media::MediaDevices`],
//! [`signaling::SignalingBackend`], [`render::SinkFactory`]). A
//! webrtc-rs-backed signaling implementation ships in [`transport`].

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod media;
pub mod peer;
pub mod render;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{MediaConstraints, Resolution, SessionConfig};
pub use error::{CallError, DeviceError, PlaybackError, RegistrationError, SessionError};
pub use events::{SessionEvent, SessionSnapshot};
pub use media::{
    CaptureQuality, LocalMediaHandle, MediaDevices, MediaTrack, RemoteMediaHandle, TrackKind,
};
pub use render::{InteractionBus, MediaSink, SinkFactory, SinkKind, SinkSource};
pub use session::{CallSession, Capabilities};
pub use signaling::{CallDirection, CallEvent, CallHandle, PendingCall, SignalingBackend};
