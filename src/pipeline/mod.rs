pub mod cache;
pub mod stream;

pub use cache::FrameCache;
pub use stream::{EncodedFrame, StreamMultiplexer};
