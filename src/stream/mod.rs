//! Outward streaming: the NDJSON frame codec and the event multiplexer.

pub mod frames;
pub mod multiplexer;

pub use frames::{decode_frame, FrameDecoder, FrameEncoder, RoutingInfo, StreamEvent};
pub use multiplexer::{start, OrderingGuard, QueryStream, StreamSettings};
