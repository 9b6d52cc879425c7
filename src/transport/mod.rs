pub mod rtc;
pub mod signal;

pub use rtc::RtcSignalingBackend;
pub use signal::{LoopbackSignalHub, SignalChannel, SignalEnvelope, SignalMessage};
