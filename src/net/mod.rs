//! Non-blocking sockets and the send-side buffering built on top of
//! [`crate::core::reactor::Reactor`].
pub mod resolve;
pub mod sendq;
pub mod socket;
pub mod timer;
