// Module: impls
// Connection logic shared by every transport; http/ only supplies the IO.

pub mod signaling;

pub use signaling::{SignalingHandler, SignalingStream};
