//! Optical shutter interface.

use crate::error::HardwareResult;

/// Interface for the laser shutters.
///
/// Channels are identified by name (typically the laser line, e.g. `"532"`).
pub trait ShutterInterface: Send {
    /// Open the shutter for `channel`.
    fn open(&mut self, channel: &str) -> HardwareResult<()>;

    /// Close the shutter for `channel`. Closing a closed shutter is not an error.
    fn close(&mut self, channel: &str) -> HardwareResult<()>;
}
