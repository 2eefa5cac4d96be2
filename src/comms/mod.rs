pub mod ack;
pub mod codec;
pub mod device_identity;
pub mod exchange;
pub mod found;
pub mod receiver;
pub mod retry_options;
pub mod service;
pub mod transport;
pub mod waiter;
pub mod writer;
