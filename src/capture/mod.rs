pub mod convert;
pub mod frame;
pub mod link;
pub mod sim;
pub mod source;
pub mod v4l2;

pub use frame::{CachedFrame, CanonicalFrame, PixelFormat, RawFrame, ScratchBuffer};
pub use link::{DeviceDescriptor, DeviceLink, DeviceSession};
pub use sim::SimulatedLink;
pub use source::{CaptureSettings, CaptureStats, FrameSource};
pub use v4l2::V4l2Link;
