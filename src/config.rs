//! Runtime Configuration
//!
//! Options resolved from the command line plus the daemon's fixed tuning
//! constants. There is no configuration file and the core reads no
//! environment variables.

/// Default upper bound on the randomized event delay, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 100;

/// Capacity of the output/overlay arenas. Compositors advertise far fewer
/// outputs than this in practice; slots are scanned linearly.
pub const MAX_DRAWABLE_LAYERS: usize = 128;

/// Half-width of the crosshair block drawn around the virtual cursor.
pub const CURSOR_RADIUS: i32 = 15;

/// udev seat the capture backend attaches to when none is given.
pub const DEFAULT_SEAT: &str = "seat0";

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on the randomized release delay in milliseconds.
    pub max_delay_ms: u64,

    /// udev seat whose input devices are captured.
    pub seat: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            seat: DEFAULT_SEAT.to_string(),
        }
    }
}
