//! Wire format: one JSON message per line, echoed back with a fresh timestamp.

mod frame;
mod message;

pub use frame::{FrameReader, decode, write_frame};
pub use message::{Message, Transform, default_transform, stamp_receive_time};
