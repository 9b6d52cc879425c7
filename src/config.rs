use serde::{Deserialize, Serialize};

/// A video frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }
}

/// Capture constraints handed to the device capability. The ideal values
/// are best-effort: a runtime that cannot satisfy them falls back to the
/// nearest supported configuration instead of failing acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub min_resolution: Resolution,
    pub ideal_resolution: Resolution,
    pub max_resolution: Resolution,
    pub max_frame_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        MediaConstraints {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            min_resolution: Resolution::new(640, 480),
            ideal_resolution: Resolution::new(1280, 720),
            max_resolution: Resolution::new(1920, 1080),
            max_frame_rate: 30,
        }
    }
}

/// Session-wide defaults applied at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions start muted until the user unmutes.
    pub start_muted: bool,
    /// Initial playout volume for remote audio, `0.0..=1.0`.
    pub volume: f32,
    pub constraints: MediaConstraints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            start_muted: true,
            volume: 1.0,
            constraints: MediaConstraints::default(),
        }
    }
}
