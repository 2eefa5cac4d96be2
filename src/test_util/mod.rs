//! Test doubles for code built on sessions: a frame codec with a matching [message::TestProtocol],
//!  and a scripted in-memory network of devices. They are used for testing this crate itself, but
//!  they are exported for application testing as well.

pub mod fake;
pub mod frame;
pub mod message;
