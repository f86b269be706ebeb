pub mod client;
pub mod protocol;

pub use client::NodeClient;
pub use protocol::{MAX_LINE_BYTES, Request, Response};
