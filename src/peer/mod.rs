pub mod registry;
pub mod session;

pub use registry::PeerSessionRegistry;
pub use session::{PeerSession, SessionPhase};
