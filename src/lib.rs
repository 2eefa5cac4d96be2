pub mod comms;
pub mod config;
pub mod errors;
pub mod session;
pub mod signal;
pub mod test_util;
pub mod util;
