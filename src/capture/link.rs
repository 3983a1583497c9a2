//! Hardware capability contract between the capture loop and a camera.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{RawFrame, ScratchBuffer};
use crate::error::DeviceError;

/// A device the link can open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
    pub path: String,
}

/// Entry point into a family of devices (V4L2, simulated, ...).
pub trait DeviceLink: Send {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Open a device. Fails with [`DeviceError::Unavailable`].
    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceSession>, DeviceError>;
}

/// An open device. Calls on one session must be serialized, which `&mut self`
/// enforces; the session is moved into the capture thread once grabbing.
pub trait DeviceSession: Send {
    /// Begin grabbing. Fails with [`DeviceError::Busy`] or [`DeviceError::Io`].
    fn start_capture(&mut self) -> Result<(), DeviceError>;

    /// Block for at most `timeout` waiting for the next frame, writing its
    /// bytes into `scratch`.
    fn read_frame<'a>(
        &mut self,
        scratch: &'a mut ScratchBuffer,
        timeout: Duration,
    ) -> Result<RawFrame<'a>, DeviceError>;

    /// Stop grabbing and release the device. Must be safe to call twice.
    fn close(&mut self);
}

/// Pick the configured device, or the first one when no selector is set.
pub fn select_device(
    devices: &[DeviceDescriptor],
    selector: Option<&str>,
) -> Option<DeviceDescriptor> {
    match selector {
        Some(wanted) => devices
            .iter()
            .find(|d| d.id == wanted || d.path == wanted)
            .cloned(),
        None => devices.first().cloned(),
    }
}
